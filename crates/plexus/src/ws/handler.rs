//! WebSocket upgrade endpoint.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::WebSocket,
    },
    http::{HeaderMap, Uri, header},
    response::Response,
};
use futures::StreamExt;
use tracing::{Instrument, Span, info, info_span};

use super::connection::Connection;
use super::hub::{Hub, HubSettings};
use super::poller::run_user_poller;
use crate::api::{AppState, ClientIp};
use crate::auth::{Identity, SessionRejection};

/// WebSocket upgrade handler.
///
/// GET /ws, GET /ws/public
pub async fn ws_handler(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, SessionRejection> {
    let cookie = headers.get(header::COOKIE).and_then(|h| h.to_str().ok());
    let identity = state
        .auth
        .authenticate_request(cookie, uri.path(), &ip)
        .await?;

    let limit = state.config.gateway.max_message_size;
    Ok(ws
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| serve_socket(socket, state, identity, ip)))
}

/// Run one upgraded connection to completion.
pub async fn serve_socket(socket: WebSocket, state: AppState, identity: Identity, ip: String) {
    let conn = Connection::new(identity, ip, &state.shutdown);
    let span = info_span!("ws", conn_id = %conn.id(), user_id = ?conn.user().id());

    async move {
        info!(ip = conn.ip(), "connection opened");
        let hub = Hub::with_plugins(
            conn.clone(),
            HubSettings::from(&state.config.gateway),
            &state.plugins,
        )
        .await;

        if !conn.user().is_anonymous() {
            tokio::spawn(
                run_user_poller(
                    conn.clone(),
                    state.services.users.clone(),
                    state.config.user_poll.clone(),
                )
                .instrument(Span::current()),
            );
        }

        let (sink, stream) = socket.split();
        hub.run(sink, stream).await;
    }
    .instrument(span)
    .await
}
