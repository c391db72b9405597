//! Turns decoded client frames into broker calls and queues the replies.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::message::{SYSTEM_CHANNEL, error_envelope};
use crate::broker::{Broker, Envelope, SubscriptionResponse};
use crate::client::ConnectionId;
use crate::poller::Poller;
use crate::transport::message::{
    AuthResponse, ChannelResponse, ClientMessage, Inbound, LoginResponse, Pong, RouteAction,
    RouteRequest, StatsReport, parse_inbound,
};
use crate::utils::error::{EngineError, ProtocolError};

/// Everything a connection handler needs: the broker and the pollers whose
/// counters go into `stats` replies.
#[derive(Clone)]
pub struct ServerContext {
    pub broker: Broker,
    pub pollers: Arc<Vec<Arc<dyn Poller>>>,
}

impl ServerContext {
    pub fn new(broker: Broker, pollers: Vec<Arc<dyn Poller>>) -> Self {
        Self {
            broker,
            pollers: Arc::new(pollers),
        }
    }

    pub fn stats(&self) -> StatsReport {
        StatsReport {
            broker: self.broker.stats(),
            pollers: self.pollers.iter().map(|p| p.stats()).collect(),
        }
    }
}

/// Handle one text frame from `id`. Never fails: every problem becomes an
/// error reply and the connection stays open.
pub fn handle_text(ctx: &ServerContext, id: &ConnectionId, text: &str) {
    ctx.broker.touch(id);

    match parse_inbound(text) {
        Ok(Inbound::Route(request)) => handle_route(ctx, id, request),
        Ok(Inbound::Client(message)) => handle_client(ctx, id, message),
        Err(e) => {
            debug!(connection = %id, error = %e, "rejected client frame");
            reply(ctx, id, &error_envelope(e.to_string()));
        }
    }
}

fn handle_route(ctx: &ServerContext, id: &ConnectionId, request: RouteRequest) {
    let Some(route) = ctx.broker.route(&request.route) else {
        let kind = format!("{}.{}", request.route, request.action.as_str());
        let envelope = error_envelope(ProtocolError::UnknownType(kind).to_string())
            .with_request_id(request.request_id);
        reply(ctx, id, &envelope);
        return;
    };

    let kind = request.response_type();
    let result = match request.action {
        RouteAction::Subscribe => route.subscribe_json(id, request.payload),
        RouteAction::Unsubscribe => route.unsubscribe_json(id, request.payload),
    };
    let response = result.unwrap_or_else(|e| {
        match &e {
            EngineError::Canonicalize { .. } => {
                error!(connection = %id, route = %request.route, error = %e, "topic derivation failed")
            }
            _ => warn!(connection = %id, route = %request.route, error = %e, "route request failed"),
        }
        SubscriptionResponse::error(None, e.to_string())
    });

    let envelope = Envelope::new(kind, request.route, response).with_request_id(request.request_id);
    reply(ctx, id, &envelope);
}

fn handle_client(ctx: &ServerContext, id: &ConnectionId, message: ClientMessage) {
    match message {
        ClientMessage::Subscribe {
            channel,
            symbol,
            request_id,
        } => {
            let result = ctx
                .broker
                .subscribe_channel(id, &channel, symbol.as_deref());
            if let Err(e) = &result {
                warn!(connection = %id, %channel, error = %e, "channel subscription rejected");
            }
            let response = ChannelResponse {
                success: result.is_ok(),
                channel: channel.clone(),
                symbol,
                error: result.err().map(|e| e.to_string()),
            };
            send(ctx, id, "subscribe_response", &channel, request_id, response);
        }
        ClientMessage::Unsubscribe {
            channel,
            symbol,
            request_id,
        } => {
            let result = ctx
                .broker
                .unsubscribe_channel(id, &channel, symbol.as_deref());
            let response = ChannelResponse {
                success: result.is_ok(),
                channel: channel.clone(),
                symbol,
                error: result.err().map(|e| e.to_string()),
            };
            send(ctx, id, "unsubscribe_response", &channel, request_id, response);
        }
        ClientMessage::Login {
            username,
            password,
            request_id,
        } => {
            let response = match ctx.broker.login(&username, &password) {
                Ok(token) => LoginResponse {
                    success: true,
                    token: Some(token),
                    error: None,
                },
                Err(e) => {
                    warn!(connection = %id, %username, "login failed");
                    LoginResponse {
                        success: false,
                        token: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            send(ctx, id, "login_response", SYSTEM_CHANNEL, request_id, response);
        }
        ClientMessage::Auth { token, request_id } => {
            let response = match ctx.broker.authenticate(id, &token) {
                Ok(user) => AuthResponse {
                    success: true,
                    user: Some(user),
                    error: None,
                },
                Err(e) => {
                    warn!(connection = %id, error = %e, "authentication failed");
                    AuthResponse {
                        success: false,
                        user: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            send(ctx, id, "auth_response", SYSTEM_CHANNEL, request_id, response);
        }
        ClientMessage::Ping { request_id } => {
            let pong = Pong {
                server_time: chrono::Utc::now().timestamp_millis(),
            };
            send(ctx, id, "pong", SYSTEM_CHANNEL, request_id, pong);
        }
        ClientMessage::Stats { request_id } => {
            send(ctx, id, "stats", SYSTEM_CHANNEL, request_id, ctx.stats());
        }
    }
}

fn send<T: Serialize>(
    ctx: &ServerContext,
    id: &ConnectionId,
    kind: &str,
    channel: &str,
    request_id: Option<String>,
    payload: T,
) {
    let envelope = Envelope::new(kind, channel, payload).with_request_id(request_id);
    reply(ctx, id, &envelope);
}

fn reply<T: Serialize>(ctx: &ServerContext, id: &ConnectionId, envelope: &Envelope<T>) {
    if let Err(e) = ctx.broker.send_to(id, envelope) {
        debug!(connection = %id, kind = %envelope.kind, error = %e, "reply not delivered");
    }
}
