//! # Dashboard WebSocket Handler
//!
//! Push channel for call state changes. Clients connect to `/ws/dashboard`
//! and send subscribe actions; the server pushes a `call_update` message
//! for every committed state transition of the calls they watch.
//!
//! ## Protocol:
//! - **Client -> Server**: `{"action": "subscribe", "call_id": "c1"}`
//!   registers for one call; omitting `call_id` subscribes to all updates.
//!   `{"action": "unsubscribe"}` drops every registration.
//! - **Server -> Client**: `{"type": "call_update", call_id, state,
//!   timestamp, ai_result?}` per transition, plus `subscribed` /
//!   `unsubscribed` acks and `error` for malformed input.
//!
//! Each registration holds a bounded buffer in the notifier; clients that
//! stop reading are dropped rather than slowing the processor down.

use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notifier::CallUpdate;
use crate::state::AppState;
use crate::store::models::{CallAiResult, CallState};

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long without any client frame before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages a dashboard client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register interest in one call, or in everything when `call_id` is
    /// omitted.
    Subscribe { call_id: Option<String> },
    /// Drop every registration held by this connection.
    Unsubscribe,
}

/// Messages pushed to dashboard clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    CallUpdate {
        call_id: String,
        state: CallState,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ai_result: Option<CallAiResult>,
    },
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
    Unsubscribed,
    Error {
        message: String,
    },
}

/// Internal actor message carrying one notifier event into the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct PushUpdate(CallUpdate);

/// One dashboard connection.
pub struct DashboardWebSocket {
    state: web::Data<AppState>,
    /// Notifier registrations owned by this connection.
    subscriptions: Vec<Uuid>,
    last_heartbeat: Instant,
}

impl DashboardWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            subscriptions: Vec::new(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "could not serialize websocket message"),
        }
    }

    fn handle_subscribe(
        &mut self,
        call_id: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let subscription = self.state.notifier.subscribe(call_id.clone());
        self.subscriptions.push(subscription.id);

        // Bridge the notifier channel into the actor mailbox. A full
        // mailbox means the client cannot keep up; the bridge ends and the
        // notifier evicts the registration on its next publish.
        let addr = ctx.address();
        let mut receiver = subscription.receiver;
        tokio::spawn(async move {
            while let Some(update) = receiver.recv().await {
                if addr.try_send(PushUpdate(update)).is_err() {
                    break;
                }
            }
        });

        debug!(call_id = ?call_id, "dashboard subscription added");
        self.send_json(ctx, &ServerMessage::Subscribed { call_id });
    }

    fn handle_unsubscribe(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        for id in self.subscriptions.drain(..) {
            self.state.notifier.unsubscribe(id);
        }
        self.send_json(ctx, &ServerMessage::Unsubscribed);
    }
}

impl Actor for DashboardWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("dashboard websocket connected");
        self.state.increment_active_connections();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("dashboard websocket heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("dashboard websocket disconnected");
        for id in self.subscriptions.drain(..) {
            self.state.notifier.unsubscribe(id);
        }
        self.state.decrement_active_connections();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DashboardWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe { call_id }) => self.handle_subscribe(call_id, ctx),
                Ok(ClientMessage::Unsubscribe) => self.handle_unsubscribe(ctx),
                Err(err) => {
                    self.send_json(
                        ctx,
                        &ServerMessage::Error {
                            message: format!("invalid message: {}", err),
                        },
                    );
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_json(
                    ctx,
                    &ServerMessage::Error {
                        message: "binary frames are not part of the dashboard protocol".to_string(),
                    },
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(reason = ?reason, "dashboard websocket closed by client");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame on dashboard websocket");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "dashboard websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<PushUpdate> for DashboardWebSocket {
    type Result = ();

    fn handle(&mut self, msg: PushUpdate, ctx: &mut Self::Context) {
        let update = msg.0;
        self.send_json(
            ctx,
            &ServerMessage::CallUpdate {
                call_id: update.call_id,
                state: update.state,
                timestamp: update.timestamp.to_rfc3339(),
                ai_result: update.ai_result,
            },
        );
    }
}

/// `GET /ws/dashboard`: upgrade to the dashboard push channel.
pub async fn dashboard_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "dashboard websocket connection request"
    );
    ws::start(DashboardWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_message_parses_with_and_without_call_id() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"action": "subscribe", "call_id": "c1"}"#).unwrap();
        match msg {
            ClientMessage::Subscribe { call_id } => assert_eq!(call_id.as_deref(), Some("c1")),
            _ => panic!("wrong message type"),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"action": "subscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { call_id: None }));

        let msg: ClientMessage = serde_json::from_str(r#"{"action": "unsubscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action": "dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_call_update_serialization_shape() {
        let message = ServerMessage::CallUpdate {
            call_id: "c1".to_string(),
            state: CallState::Completed,
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            ai_result: None,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"call_update\""));
        assert!(json.contains("\"state\":\"COMPLETED\""));
        assert!(!json.contains("ai_result"));
    }

    #[test]
    fn test_error_message_serialization() {
        let message = ServerMessage::Error {
            message: "invalid message".to_string(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("invalid message"));
    }
}
