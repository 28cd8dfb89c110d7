pub mod system;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::system::SystemState;
use crate::{
    auth::{jwt::JwtTokenService, middleware::require_bearer_auth},
    broker::Broker,
};

/// System endpoints, all behind bearer auth.
pub fn router(jwt_service: Arc<JwtTokenService>, broker: Option<Arc<Broker>>) -> Router {
    Router::new()
        .route("/api/getConnectionStats", get(system::connection_stats))
        .route("/api/disconnectAllConnections", post(system::disconnect_all))
        .route("/api/getForceoutUserCount", get(system::forceout_user_count))
        .route("/api/clearForceoutUsers", post(system::clear_forceout_users))
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
        .with_state(SystemState { broker })
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::{
        auth::jwt::JwtTokenService,
        broker::{Broker, BrokerConfig},
        cache::Caches,
        forceout::ForceoutRegistry,
        upstream::resolver::UpstreamResolver,
        ws::session::test_support::channel_session,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "liao_test_secret_that_is_definitely_long_enough";

    struct Fixture {
        app: Router,
        token: String,
        broker: Arc<Broker>,
    }

    fn fixture() -> Fixture {
        let jwt = Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let token = jwt.issue_for_tests("operator", 60);
        let broker = Broker::new(
            BrokerConfig::default(),
            UpstreamResolver::fixed("ws://127.0.0.1:1"),
            Arc::new(ForceoutRegistry::default()),
            Caches::memory(),
        );
        Fixture { app: router(jwt, Some(Arc::clone(&broker))), token, broker }
    }

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        (status, serde_json::from_slice(&body).expect("response body should be json"))
    }

    #[tokio::test]
    async fn endpoints_require_bearer_auth() {
        let fixture = fixture();
        for (method, uri) in [
            (Method::GET, "/api/getConnectionStats"),
            (Method::POST, "/api/disconnectAllConnections"),
            (Method::GET, "/api/getForceoutUserCount"),
            (Method::POST, "/api/clearForceoutUsers"),
        ] {
            let (status, body) = call(&fixture.app, method, uri, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} should require auth");
            assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");
        }
    }

    #[tokio::test]
    async fn empty_broker_reports_zero_stats() {
        let fixture = fixture();
        let (status, body) =
            call(&fixture.app, Method::GET, "/api/getConnectionStats", Some(&fixture.token)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "code": 0,
                "msg": "success",
                "data": {
                    "active": 0,
                    "upstream": 0,
                    "downstream": 0,
                    "maxIdentities": 2,
                    "availableSlots": 2,
                }
            })
        );
    }

    #[tokio::test]
    async fn forceout_count_and_clear() {
        let fixture = fixture();
        fixture.broker.forceout().add("u1");
        fixture.broker.forceout().add("u2");

        let (_, count) =
            call(&fixture.app, Method::GET, "/api/getForceoutUserCount", Some(&fixture.token)).await;
        assert_eq!(count, json!({ "code": 0, "data": 2 }));

        let (_, cleared) =
            call(&fixture.app, Method::POST, "/api/clearForceoutUsers", Some(&fixture.token)).await;
        assert_eq!(cleared, json!({ "code": 0, "msg": "已清除2个被禁止的用户" }));
        assert_eq!(fixture.broker.forceout().count(), 0);
    }

    #[tokio::test]
    async fn disconnect_all_closes_every_session() {
        let fixture = fixture();
        let (session, _frames) = channel_session();
        fixture.broker.register_downstream("u1", Arc::clone(&session), "").await;

        let (status, body) = call(
            &fixture.app,
            Method::POST,
            "/api/disconnectAllConnections",
            Some(&fixture.token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "code": 0, "msg": "所有连接已断开" }));
        assert!(session.is_closed());
        assert_eq!(fixture.broker.connection_stats().active, 0);
    }

    #[tokio::test]
    async fn missing_broker_reports_uninitialized() {
        let jwt = Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt service should initialize"));
        let token = jwt.issue_for_tests("operator", 60);
        let app = router(jwt, None);

        let (status, body) = call(&app, Method::GET, "/api/getConnectionStats", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "code": -1, "msg": "WebSocket管理器未初始化" }));
    }
}
