// Operator endpoints for connection and force-out state.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::broker::Broker;

const BROKER_UNAVAILABLE: &str = "WebSocket管理器未初始化";

#[derive(Clone)]
pub struct SystemState {
    pub broker: Option<Arc<Broker>>,
}

fn unavailable() -> Json<Value> {
    Json(json!({ "code": -1, "msg": BROKER_UNAVAILABLE }))
}

pub async fn connection_stats(State(state): State<SystemState>) -> Json<Value> {
    let Some(broker) = state.broker else {
        return unavailable();
    };
    Json(json!({ "code": 0, "msg": "success", "data": broker.connection_stats() }))
}

pub async fn disconnect_all(State(state): State<SystemState>) -> Json<Value> {
    let Some(broker) = state.broker else {
        return unavailable();
    };
    info!("operator requested disconnect of all connections");
    broker.close_all_connections().await;
    Json(json!({ "code": 0, "msg": "所有连接已断开" }))
}

pub async fn forceout_user_count(State(state): State<SystemState>) -> Json<Value> {
    let Some(broker) = state.broker else {
        return unavailable();
    };
    Json(json!({ "code": 0, "data": broker.forceout().count() }))
}

pub async fn clear_forceout_users(State(state): State<SystemState>) -> Json<Value> {
    let Some(broker) = state.broker else {
        return unavailable();
    };
    let cleared = broker.forceout().clear();
    info!(cleared, "operator cleared force-out bans");
    Json(json!({ "code": 0, "msg": format!("已清除{cleared}个被禁止的用户") }))
}
