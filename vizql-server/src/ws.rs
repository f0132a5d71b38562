//! `GET /ws/dashboard/{dashboardID}`: upgrades to a WebSocket, registers a
//! gateway session, and relays both inbound control messages and outbound
//! fan-out deltas for the lifetime of the socket. Each connection gets its
//! own read/write task pair.

use std::collections::HashSet;
use std::sync::Arc;

use actix_web::{web, Error as ActixError, HttpMessage, HttpRequest, HttpResponse};
use serde::Deserialize;
use vizql_gateway::service::DashboardSession;
use vizql_gateway::{FanOut, OutboundMessage, Session};

use crate::auth::Identity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        widget_id: String,
        #[serde(default)]
        tables: HashSet<String>,
    },
    Unsubscribe {
        widget_id: String,
    },
    Pong,
}

/// One implementor per connection, as `vizql-gateway::service::DashboardSession`
/// requires: bundles the gateway session with the `FanOut` handle its
/// disconnect path needs to unsubscribe the tenant's bus pattern.
struct ActixDashboardSession {
    session: Arc<Session>,
    fan_out: Arc<FanOut>,
}

#[async_trait::async_trait]
impl DashboardSession for ActixDashboardSession {
    async fn on_client_message(&self, raw: serde_json::Value) {
        match serde_json::from_value::<ClientMessage>(raw) {
            Ok(ClientMessage::Subscribe { widget_id, tables }) => {
                self.session.subscribe_widget(widget_id, tables);
            }
            Ok(ClientMessage::Unsubscribe { widget_id }) => {
                self.session.unsubscribe_widget(&widget_id);
            }
            Ok(ClientMessage::Pong) => {
                self.session.record_pong();
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping unrecognized dashboard ws message");
            }
        }
    }

    async fn on_disconnect(&self) {
        self.fan_out.disconnect(&self.session.id, &self.session.tenant).await;
        tracing::info!(
            session = %self.session.id,
            tenant = %self.session.tenant.0,
            "dashboard ws disconnected"
        );
    }
}

fn outbound_to_text(message: OutboundMessage) -> Option<String> {
    serde_json::to_string(&message).ok()
}

pub async fn dashboard_ws(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ActixError> {
    let identity = req
        .extensions()
        .get::<Identity>()
        .cloned()
        .ok_or_else(|| actix_web::error::ErrorInternalServerError("missing identity"))?;
    let dashboard_id = path.into_inner();

    let (response, mut ws_session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let (gateway_session, mut outbound_rx) =
        Session::new(identity.tenant.clone(), identity.user.clone(), identity.roles.clone());
    let session = state.fan_out.connect(gateway_session).await;
    state.session_index.subscribe(
        &session.id,
        format!("{}:dashboard:{}", identity.tenant.0, dashboard_id),
    );

    tracing::info!(session = %session.id, tenant = %identity.tenant.0, dashboard = %dashboard_id, "dashboard ws connected");

    let mut writer_ws = ws_session.clone();
    actix_web::rt::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Some(text) = outbound_to_text(message) else {
                continue;
            };
            if writer_ws.text(text).await.is_err() {
                break;
            }
        }
    });

    let dashboard_session = ActixDashboardSession { session: session.clone(), fan_out: state.fan_out.clone() };
    actix_web::rt::spawn(async move {
        use futures_util::StreamExt;

        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                actix_ws::Message::Text(text) => {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                        dashboard_session.on_client_message(value).await;
                    }
                }
                actix_ws::Message::Pong(_) => dashboard_session.session.record_pong(),
                actix_ws::Message::Ping(bytes) => {
                    let _ = ws_session.pong(&bytes).await;
                }
                actix_ws::Message::Close(_) => break,
                _ => {}
            }
        }

        dashboard_session.on_disconnect().await;
    });

    Ok(response)
}
