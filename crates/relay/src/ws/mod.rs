pub mod session;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use liao_common::value::field_string;
use serde_json::Value;
use tracing::{debug, info};

use self::session::DownstreamSession;
use crate::{
    auth::{
        credential::{authenticate, TokenSource},
        jwt::JwtTokenService,
    },
    broker::Broker,
    error::{request_id_from_headers_or_generate, with_request_id_scope},
};

pub const INVALID_TOKEN_BODY: &str = "WebSocket连接Token无效";

#[derive(Clone)]
pub struct ProxyState {
    jwt_service: Arc<JwtTokenService>,
    broker: Arc<Broker>,
}

pub fn router(jwt_service: Arc<JwtTokenService>, broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(ProxyState { jwt_service, broker })
}

async fn ws_upgrade(
    State(state): State<ProxyState>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Checked before the upgrade so a bad token never opens a socket.
    if let Err(failure) =
        authenticate(&state.jwt_service, TokenSource::QueryParam, &headers, &uri)
    {
        debug!(?failure, "websocket upgrade rejected");
        return (StatusCode::UNAUTHORIZED, INVALID_TOKEN_BODY).into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let broker = state.broker;
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, proxy_socket(broker, socket)).await;
    })
}

/// Read frames until the client leaves or the broker closes the session.
async fn proxy_socket(broker: Arc<Broker>, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let session = Arc::new(DownstreamSession::new(
        Box::pin(sink),
        broker.config().downstream_write_deadline,
    ));
    let mut bound: Option<String> = None;
    debug!(session = %session.id(), "downstream connected");

    loop {
        let frame = tokio::select! {
            _ = session.closed() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_frame(&broker, &session, &mut bound, text.as_str()).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                debug!(session = %session.id(), %error, "downstream read failed");
                break;
            }
        }
    }

    if let Some(identity) = bound.take() {
        broker.unregister_downstream(&identity, &session);
    }
    session.close().await;
    debug!(session = %session.id(), "downstream disconnected");
}

/// Route one text frame. Frames without `act` and `id`, or whose `id`
/// disagrees with the bound identity, are dropped.
async fn handle_frame(
    broker: &Arc<Broker>,
    session: &Arc<DownstreamSession>,
    bound: &mut Option<String>,
    raw: &str,
) {
    let Ok(Value::Object(node)) = serde_json::from_str::<Value>(raw) else {
        return;
    };
    let act = field_string(&node, "act");
    let id = field_string(&node, "id");
    if act.is_empty() || id.is_empty() {
        return;
    }

    if act == "sign" {
        if let Some(previous) = bound.as_deref().filter(|previous| *previous != id) {
            info!(session = %session.id(), from = %previous, to = %id, "downstream switching identity");
            broker.unregister_downstream(previous, session);
        }
        *bound = Some(id.clone());
        broker.register_downstream(&id, Arc::clone(session), raw).await;
        return;
    }

    match bound.as_deref() {
        Some(identity) if identity == id => broker.send_to_upstream(identity, raw).await,
        _ => debug!(session = %session.id(), act = %act, "dropping frame for unbound identity"),
    }
}

#[cfg(test)]
mod tests {
    use super::{router, INVALID_TOKEN_BODY};
    use crate::{
        auth::jwt::JwtTokenService,
        broker::{Broker, BrokerConfig},
        cache::Caches,
        forceout::ForceoutRegistry,
        upstream::{resolver::UpstreamResolver, test_support::spawn_upstream},
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use futures_util::{SinkExt, StreamExt};
    use std::{sync::Arc, time::Duration};
    use tokio::{net::TcpListener, sync::mpsc};
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    const TEST_SECRET: &str = "liao_test_secret_that_is_definitely_long_enough";

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct Harness {
        ws_url: String,
        broker: Arc<Broker>,
        upstream_frames: mpsc::UnboundedReceiver<String>,
    }

    fn jwt() -> Arc<JwtTokenService> {
        Arc::new(JwtTokenService::new(TEST_SECRET).expect("jwt service should initialize"))
    }

    fn broker_for(url: &str) -> Arc<Broker> {
        Broker::new(
            BrokerConfig { close_delay: Duration::from_secs(30), ..BrokerConfig::default() },
            UpstreamResolver::fixed(url),
            Arc::new(ForceoutRegistry::default()),
            Caches::memory(),
        )
    }

    async fn start(greeting: Option<&'static str>) -> Harness {
        let (upstream_url, upstream_frames) = spawn_upstream(greeting).await;
        let broker = broker_for(&upstream_url);
        let jwt = jwt();
        let token = jwt.issue_for_tests("client", 60);
        let app = router(jwt, Arc::clone(&broker));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("proxy server should run");
        });

        Harness { ws_url: format!("ws://{addr}/ws?token={token}"), broker, upstream_frames }
    }

    async fn next_upstream(harness: &mut Harness) -> String {
        tokio::time::timeout(Duration::from_secs(5), harness.upstream_frames.recv())
            .await
            .expect("upstream frame should arrive")
            .expect("upstream channel should stay open")
    }

    async fn next_text(socket: &mut ClientSocket) -> String {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("downstream frame should arrive")
                .expect("socket should stay open")
                .expect("frame should decode");
            if let WsFrame::Text(text) = frame {
                return text.as_str().to_owned();
            }
        }
    }

    async fn upgrade_status(uri: &str) -> (StatusCode, String) {
        let app = router(jwt(), broker_for("ws://127.0.0.1:1"));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        (status, String::from_utf8(body.to_vec()).expect("body should be utf8"))
    }

    #[tokio::test]
    async fn upgrade_without_token_is_unauthorized() {
        let (status, body) = upgrade_status("/ws").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, INVALID_TOKEN_BODY);
    }

    #[tokio::test]
    async fn upgrade_with_invalid_token_is_unauthorized() {
        let (status, body) = upgrade_status("/ws?token=not-a-jwt").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, INVALID_TOKEN_BODY);
    }

    #[tokio::test]
    async fn bearer_header_alone_does_not_open_the_socket() {
        let token = jwt().issue_for_tests("client", 60);
        let app = router(jwt(), broker_for("ws://127.0.0.1:1"));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_without_upgrade_headers_is_rejected_by_axum() {
        let token = jwt().issue_for_tests("client", 60);
        let (status, _) = upgrade_status(&format!("/ws?token={token}")).await;
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn sign_then_messages_are_forwarded_in_order() {
        let mut harness = start(None).await;
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");

        let sign = r#"{"act":"sign","id":"u1","pass":"x"}"#;
        let say = r#"{"act":"say","id":"u1","msg":"hi"}"#;
        socket.send(WsFrame::text(sign)).await.expect("sign should send");
        socket.send(WsFrame::text(say)).await.expect("say should send");

        assert_eq!(next_upstream(&mut harness).await, sign);
        assert_eq!(next_upstream(&mut harness).await, say);
        assert_eq!(harness.broker.session_count("u1"), 1);
    }

    #[tokio::test]
    async fn malformed_and_mismatched_frames_are_dropped() {
        let mut harness = start(None).await;
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");

        socket.send(WsFrame::text(r#"{"act":"say","id":"u1"}"#)).await.expect("send");
        socket.send(WsFrame::text("not json")).await.expect("send");
        socket.send(WsFrame::binary(vec![1, 2, 3])).await.expect("send");
        socket.send(WsFrame::text(r#"{"act":"sign","id":"u1"}"#)).await.expect("send");
        socket.send(WsFrame::text(r#"{"act":"say","id":"u2"}"#)).await.expect("send");
        socket.send(WsFrame::text(r#"{"act":"say"}"#)).await.expect("send");
        socket.send(WsFrame::text(r#"{"act":"say","id":" u1 ","n":1}"#)).await.expect("send");

        assert_eq!(next_upstream(&mut harness).await, r#"{"act":"sign","id":"u1"}"#);
        assert_eq!(next_upstream(&mut harness).await, r#"{"act":"say","id":" u1 ","n":1}"#);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.upstream_frames.try_recv().is_err());
        assert!(harness.broker.upstream_client("u2").is_none());
    }

    #[tokio::test]
    async fn upstream_frames_reach_the_client() {
        let greeting = r#"{"code":1,"content":"welcome"}"#;
        let harness = start(Some(greeting)).await;
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");

        socket.send(WsFrame::text(r#"{"act":"sign","id":"u1"}"#)).await.expect("send");
        assert_eq!(next_text(&mut socket).await, greeting);
    }

    #[tokio::test]
    async fn re_sign_as_another_identity_moves_the_session() {
        let mut harness = start(None).await;
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");

        socket.send(WsFrame::text(r#"{"act":"sign","id":"u1"}"#)).await.expect("send");
        next_upstream(&mut harness).await;
        socket.send(WsFrame::text(r#"{"act":"sign","id":"u2"}"#)).await.expect("send");
        next_upstream(&mut harness).await;

        assert_eq!(harness.broker.session_count("u1"), 0);
        assert!(harness.broker.has_pending_close("u1"));
        assert_eq!(harness.broker.session_count("u2"), 1);
    }

    #[tokio::test]
    async fn client_disconnect_arms_the_pending_close() {
        let mut harness = start(None).await;
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");
        socket.send(WsFrame::text(r#"{"act":"sign","id":"u1"}"#)).await.expect("send");
        next_upstream(&mut harness).await;

        socket.close(None).await.expect("client should close");
        drop(socket);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !harness.broker.has_pending_close("u1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending close should be armed after disconnect");
        assert_eq!(harness.broker.session_count("u1"), 0);
        assert!(harness.broker.upstream_client("u1").is_some());
    }

    #[tokio::test]
    async fn banned_identity_receives_reject_frame_and_close() {
        let harness = start(None).await;
        harness.broker.forceout().add("u1");
        let (mut socket, _) =
            connect_async(harness.ws_url.as_str()).await.expect("client should connect");

        socket.send(WsFrame::text(r#"{"act":"sign","id":"u1"}"#)).await.expect("send");
        let reject = next_text(&mut socket).await;
        assert!(reject.contains("\"code\":-4"));
        assert!(reject.contains("\"forceout\":true"));

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match socket.next().await {
                    Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "server should close the rejected socket");
    }
}
