//! WebSocket topic streams
//!
//! A client connected to `/topics/{topic}/ws` becomes a broker subscriber for
//! the lifetime of the socket. Every delivered message is pushed as
//! `{ "event": "message", "data": <Message> }`. Text frames sent by the client
//! are parsed as publish requests on the same topic.

use crate::server::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use intercom_broker::{CallbackResult, PublishOptions, Subscriber};
use intercom_core::{EventMessage, Message, PublishRequest, Topic};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Messages buffered per client before delivery to it starts failing.
const CLIENT_BUFFER: usize = 256;

/// Hands broker deliveries to the socket task. A full buffer fails the
/// callback instead of stalling the topic worker.
struct SocketForwarder {
    name: String,
    tx: mpsc::Sender<Arc<Message>>,
}

#[async_trait::async_trait]
impl Subscriber for SocketForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, message: Arc<Message>) -> CallbackResult {
        self.tx
            .try_send(message)
            .map_err(|e| format!("client buffer: {}", e).into())
    }
}

pub async fn handle_topic_stream(socket: WebSocket, topic: Topic, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel(CLIENT_BUFFER);
    let handle = state.broker.subscribe(
        topic.clone(),
        SocketForwarder {
            name: format!("ws:{}", topic),
            tx,
        },
    );
    info!("WebSocket client subscribed to '{}'", topic);

    if send_event(&mut ws_tx, &EventMessage::subscribed(topic.as_str()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let reply = handle_text_message(&text, &topic, &state);
                            if send_event(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(_))) => {
                            if send_event(&mut ws_tx, &EventMessage::pong()).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WebSocket error on '{}': {}", topic, e);
                            break;
                        }
                        _ => {}
                    }
                }

                delivered = rx.recv() => {
                    let Some(message) = delivered else { break };
                    if send_event(&mut ws_tx, &EventMessage::message(&message)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.broker.unsubscribe(&handle);
    info!("WebSocket client left '{}'", topic);
}

/// Publish a client frame on the stream's topic and describe the outcome.
fn handle_text_message(text: &str, topic: &Topic, state: &AppState) -> EventMessage {
    let mut value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return EventMessage::new("error", json!({ "error": e.to_string() })),
    };
    if let Some(obj) = value.as_object_mut() {
        obj.entry("topic")
            .or_insert_with(|| json!(topic.as_str()));
    }

    let request: PublishRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => return EventMessage::new("error", json!({ "error": e.to_string() })),
    };
    match publish_options(&request) {
        Ok(options) => {
            let id = state
                .broker
                .publish(request.topic.as_str(), request.payload, options);
            debug!("WebSocket client published {} on '{}'", id, request.topic);
            EventMessage::new("published", json!({ "id": id }))
        }
        Err(e) => EventMessage::new("error", json!({ "error": e.to_string() })),
    }
}

/// Build broker options from a publish request. Rejects a malformed TTL.
pub(crate) fn publish_options(request: &PublishRequest) -> intercom_core::Result<PublishOptions> {
    Ok(PublishOptions {
        priority: request.priority,
        sender_id: request.sender_id.clone(),
        ttl: request.ttl()?,
        headers: request.headers.clone(),
    })
}

async fn send_event<S>(ws_tx: &mut S, event: &EventMessage) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let json = serde_json::to_string(event).map_err(|_| ())?;
    ws_tx.send(WsMessage::Text(json)).await.map_err(|_| ())
}
