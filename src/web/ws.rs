use crate::error::ControlError;
use crate::session::SessionController;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::ws::Message;
use warp::{Filter, Rejection};

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(rename = "type")]
    msg_type: String,
}

/// `GET /api/events`: a snapshot followed by every control event as JSON.
pub fn route(
    controller: Arc<SessionController>,
) -> impl Filter<Extract = impl warp::Reply, Error = Rejection> + Clone {
    warp::path!("api" / "events")
        .and(warp::ws())
        .and(warp::any().map(move || controller.clone()))
        .map(|ws: warp::ws::Ws, controller| {
            ws.on_upgrade(move |socket| client_connected(socket, controller))
        })
}

async fn client_connected(ws: warp::ws::WebSocket, controller: Arc<SessionController>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut rx = UnboundedReceiverStream::new(rx);

    tokio::spawn(async move {
        while let Some(msg) = rx.next().await {
            if let Err(e) = ws_tx.send(msg).await {
                tracing::debug!("WebSocket send error: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // subscribe first so nothing published after the snapshot is missed
    let mut events = controller.subscribe();
    let subscriber = events.id();
    tracing::debug!(subscriber, "Event stream client connected");

    let initial = serde_json::json!({
        "type": "initial",
        "data": {
            "session": controller.status(),
            "activeFlows": controller.active_flows(),
            "pendingBreakpoints": controller.pending_breakpoints(),
        }
    });
    if tx.send(Message::text(initial.to_string())).is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    let payload = serde_json::json!({ "type": "event", "data": event });
                    if tx.send(Message::text(payload.to_string())).is_err() {
                        break;
                    }
                }
                Some(Err(ControlError::Overflow(_))) | None => {
                    let payload = serde_json::json!({
                        "type": "overflow",
                        "data": { "subscriber": subscriber }
                    });
                    let _ = tx.send(Message::text(payload.to_string()));
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Event stream failed");
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(msg)) => handle_ws_message(msg, &tx),
                Some(Err(e)) => {
                    tracing::debug!("WebSocket receive error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    tracing::debug!(subscriber, "Event stream client disconnected");
}

fn handle_ws_message(msg: Message, tx: &mpsc::UnboundedSender<Message>) {
    let Ok(text) = msg.to_str() else {
        return;
    };
    match serde_json::from_str::<WsMessage>(text) {
        Ok(msg) if msg.msg_type == "ping" => {
            let _ = tx.send(Message::text(r#"{"type":"pong"}"#));
        }
        Ok(msg) => {
            tracing::debug!("Unknown WebSocket message type: {}", msg.msg_type);
        }
        Err(e) => {
            tracing::debug!("Ignoring malformed WebSocket message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SessionConfig};
    use crate::test_utils::MockAdapter;

    #[tokio::test]
    async fn test_stream_starts_with_snapshot_then_events() {
        let controller = Arc::new(
            SessionController::new(Arc::new(MockAdapter::new()), &Config::default()).unwrap(),
        );
        let mut client = warp::test::ws()
            .path("/api/events")
            .handshake(route(controller.clone()))
            .await
            .expect("handshake");

        let initial = client.recv().await.unwrap();
        let initial: serde_json::Value = serde_json::from_str(initial.to_str().unwrap()).unwrap();
        assert_eq!(initial["type"], "initial");
        assert_eq!(initial["data"]["session"]["state"], "stopped");

        controller.start(SessionConfig::default()).await.unwrap();

        let first = client.recv().await.unwrap();
        let first: serde_json::Value = serde_json::from_str(first.to_str().unwrap()).unwrap();
        assert_eq!(first["type"], "event");
        assert_eq!(first["data"]["type"], "session");
        assert_eq!(first["data"]["state"], "starting");
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let controller = Arc::new(
            SessionController::new(Arc::new(MockAdapter::new()), &Config::default()).unwrap(),
        );
        let mut client = warp::test::ws()
            .path("/api/events")
            .handshake(route(controller))
            .await
            .expect("handshake");
        let _initial = client.recv().await.unwrap();

        client.send_text(r#"{"type":"ping"}"#).await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.to_str().unwrap(), r#"{"type":"pong"}"#);
    }
}
