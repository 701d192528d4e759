//! [`PlatformAdapter`] that drives an out-of-process engine over a WebSocket.

use super::wire::{self, ControlMessage, EngineMessage};
use super::{Ack, AdapterEvent, EngineState, EventSink, PlatformAdapter};
use crate::config::{AdapterConfig, SessionConfig};
use crate::error::AdapterError;
use crate::flow::{FlowId, Modifications};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type Reply = oneshot::Sender<Result<(), AdapterError>>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

pub struct BridgeAdapter {
    url: String,
    start_timeout: Duration,
    stop_timeout: Duration,
    command_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    pending: Arc<DashMap<String, Reply>>,
}

impl BridgeAdapter {
    pub fn new(config: &AdapterConfig) -> Self {
        Self {
            url: config.bridge_url.clone(),
            start_timeout: config.start_timeout(),
            stop_timeout: config.stop_timeout(),
            command_timeout: config.command_timeout(),
            connection: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens and closes a throwaway connection to check the bridge is reachable.
    pub async fn probe(&self) -> Result<(), AdapterError> {
        let (mut stream, _) =
            tokio::time::timeout(self.start_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| AdapterError::ConnectionLost(format!("timed out connecting to {}", self.url)))?
                .map_err(|e| AdapterError::ConnectionLost(format!("cannot reach {}: {}", self.url, e)))?;
        let _ = stream.close(None).await;
        Ok(())
    }

    async fn connect(&self, events: EventSink) -> Result<(), AdapterError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }

        let (stream, _) = tokio::time::timeout(self.start_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| AdapterError::StartFailed(format!("timed out connecting to {}", self.url)))?
            .map_err(|e| AdapterError::StartFailed(format!("cannot reach {}: {}", self.url, e)))?;
        tracing::info!(url = %self.url, "Connected to engine bridge");

        let (mut sink, mut stream) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval_at(
                tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
                KEEPALIVE_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    _ = keepalive.tick() => {
                        if let Ok(ping) = wire::encode(&ControlMessage::Ping) {
                            if let Err(e) = sink.send(Message::Text(ping)).await {
                                tracing::warn!(error = %e, "Engine bridge keepalive failed");
                                break;
                            }
                        }
                    }
                    message = outgoing_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                tracing::warn!(error = %e, "Failed to write to engine bridge");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader_cancel = cancel.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break None,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(&text, &pending, &events),
                    Some(Ok(Message::Close(_))) | None => {
                        break Some("engine bridge closed the connection".to_string())
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                }
            };

            let keys: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, reply)) = pending.remove(&key) {
                    let _ = reply.send(Err(AdapterError::ConnectionLost(
                        "engine bridge disconnected".to_string(),
                    )));
                }
            }

            if let Some(reason) = reason {
                tracing::error!(reason = %reason, "Lost engine bridge");
                events.send(AdapterEvent::StatusChanged {
                    state: EngineState::Failed,
                    message: Some(reason),
                });
            }
        });

        *connection = Some(Connection { outgoing, cancel });
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.cancel.cancel();
        }
    }

    async fn command(&self, message: ControlMessage, timeout: Duration) -> Result<(), AdapterError> {
        let outgoing = match self.connection.lock().await.as_ref() {
            Some(connection) => connection.outgoing.clone(),
            None => {
                return Err(AdapterError::ConnectionLost(
                    "not connected to the engine bridge".to_string(),
                ))
            }
        };

        let text = wire::encode(&message)?;
        let command_id = message.command_id().map(str::to_string);
        let reply = command_id.as_ref().map(|id| {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(id.clone(), tx);
            rx
        });

        if outgoing.send(Message::Text(text)).is_err() {
            if let Some(id) = &command_id {
                self.pending.remove(id);
            }
            return Err(AdapterError::ConnectionLost(
                "engine bridge writer has stopped".to_string(),
            ));
        }

        let (Some(id), Some(reply)) = (command_id, reply) else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::ConnectionLost(
                "engine bridge disconnected".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(AdapterError::ConnectionLost(format!(
                    "no reply to command {} within {:?}",
                    id, timeout
                )))
            }
        }
    }
}

fn handle_frame(text: &str, pending: &DashMap<String, Reply>, events: &EventSink) {
    let message: EngineMessage = match wire::decode(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed bridge frame");
            return;
        }
    };

    match message {
        EngineMessage::Ack { command_id } => {
            if let Some((_, reply)) = pending.remove(&command_id) {
                let _ = reply.send(Ok(()));
            }
        }
        EngineMessage::Nack { command_id, reason } => {
            if let Some((_, reply)) = pending.remove(&command_id) {
                let _ = reply.send(Err(AdapterError::CommandRejected(reason)));
            }
        }
        other => match other.into_event() {
            Ok(Some(event)) => {
                events.send(event);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Dropping invalid engine event"),
        },
    }
}

fn command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl PlatformAdapter for BridgeAdapter {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn start(&self, config: &SessionConfig, events: EventSink) -> Result<Ack, AdapterError> {
        self.connect(events).await?;

        let start = ControlMessage::Start {
            command_id: command_id(),
            config: config.clone(),
        };
        match self.command(start, self.start_timeout).await {
            Ok(()) => Ok(Ack::with_detail(format!(
                "engine listening on {}",
                config.listen_address()
            ))),
            Err(e) => {
                self.disconnect().await;
                Err(match e {
                    AdapterError::StartFailed(_) => e,
                    other => AdapterError::StartFailed(other.to_string()),
                })
            }
        }
    }

    async fn stop(&self) -> Result<Ack, AdapterError> {
        if self.connection.lock().await.is_none() {
            return Ok(Ack::with_detail("engine already stopped"));
        }

        let stop = ControlMessage::Stop {
            command_id: command_id(),
        };
        let result = self.command(stop, self.stop_timeout).await;
        self.disconnect().await;

        match result {
            Ok(()) => Ok(Ack::default()),
            Err(e) => Err(AdapterError::StopFailed(e.to_string())),
        }
    }

    async fn hold_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError> {
        self.command(
            ControlMessage::Hold {
                command_id: command_id(),
                flow_id: flow_id.clone(),
            },
            self.command_timeout,
        )
        .await
    }

    async fn continue_connection(
        &self,
        flow_id: &FlowId,
        modifications: Option<&Modifications>,
    ) -> Result<(), AdapterError> {
        self.command(
            ControlMessage::Continue {
                command_id: command_id(),
                flow_id: flow_id.clone(),
                modified: modifications.cloned(),
            },
            self.command_timeout,
        )
        .await
    }

    async fn abort_connection(&self, flow_id: &FlowId) -> Result<(), AdapterError> {
        self.command(
            ControlMessage::Abort {
                command_id: command_id(),
                flow_id: flow_id.clone(),
            },
            self.command_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RawFlowEvent, RawFlowKind};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Fake engine: acks everything except `hold`, and reports one request
    /// after the session starts.
    async fn spawn_engine() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();

            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["v"], 1);
                let id = frame["commandId"].as_str().unwrap_or_default().to_string();
                let reply = match frame["type"].as_str() {
                    Some("hold") => json!({"v": 1, "type": "nack", "commandId": id, "reason": "busy"}),
                    _ => json!({"v": 1, "type": "ack", "commandId": id}),
                };
                ws.send(Message::Text(reply.to_string())).await.unwrap();

                if frame["type"] == "start" {
                    let flow = json!({
                        "v": 1,
                        "type": "flow",
                        "phase": "request",
                        "id": "f1",
                        "seq": 1,
                        "request": {"method": "GET", "url": "https://example.com/"}
                    });
                    ws.send(Message::Text(flow.to_string())).await.unwrap();
                }
                if frame["type"] == "stop" {
                    break;
                }
            }
        });

        format!("ws://{}", addr)
    }

    fn adapter_for(url: String) -> BridgeAdapter {
        BridgeAdapter::new(&AdapterConfig {
            bridge_url: url,
            start_timeout_ms: 2_000,
            stop_timeout_ms: 2_000,
            command_timeout_ms: 2_000,
        })
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let adapter = adapter_for(spawn_engine().await);
        let (sink, mut events) = EventSink::channel();

        let ack = adapter.start(&SessionConfig::default(), sink).await.unwrap();
        assert!(ack.detail.unwrap().contains("127.0.0.1:8080"));

        match events.recv().await.unwrap() {
            AdapterEvent::Flow(RawFlowEvent {
                flow_id,
                sequence,
                kind: RawFlowKind::RequestReceived(request),
            }) => {
                assert_eq!(flow_id.as_str(), "f1");
                assert_eq!(sequence, Some(1));
                assert_eq!(request.method, "GET");
            }
            other => panic!("unexpected event {:?}", other),
        }

        adapter.continue_connection(&FlowId::new("f1"), None).await.unwrap();
        let err = adapter.hold_connection(&FlowId::new("f1")).await.unwrap_err();
        assert_eq!(err, AdapterError::CommandRejected("busy".to_string()));

        adapter.stop().await.unwrap();
        // second stop is a no-op
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_bridge_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let adapter = adapter_for(format!("ws://{}", addr));
        let (sink, _events) = EventSink::channel();
        let err = adapter.start(&SessionConfig::default(), sink).await.unwrap_err();
        assert!(matches!(err, AdapterError::StartFailed(_)));
        assert!(adapter.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let adapter = adapter_for("ws://127.0.0.1:1".to_string());
        let err = adapter.abort_connection(&FlowId::new("f1")).await.unwrap_err();
        assert!(matches!(err, AdapterError::ConnectionLost(_)));
    }
}
