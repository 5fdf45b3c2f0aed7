use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::app_state::AppState;
use super::rate_limit::client_ip;
use crate::engine::channel::{Channel, JoinRequest};
use crate::engine::error::JoinError;
use crate::engine::events::{ChannelEvent, ChannelRequest};
use crate::engine::member::{MAX_OUTBOUND_QUEUE, MemberId, MpscRecipient};
use crate::engine::validation::{validate_channel_name, validate_name};

/// Largest inbound frame accepted from a client.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Query parameters for `/socket/{channel}`. An absent name joins as an
/// anonymous viewer.
#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    #[serde(default)]
    pub name: String,
    pub password: Option<String>,
}

/// GET /socket/{channel}: validate the request, then upgrade.
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(channel): Path<String>,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = validate_channel_name(&channel) {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }
    if !params.name.is_empty()
        && let Err(e) = validate_name(&params.name)
    {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    let ip = client_ip(&headers, Some(addr), state.trust_proxy);
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, channel, params, ip))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn write_event(sender: &mut WsSink, event: &ChannelEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to encode outbound event");
            Ok(())
        }
    }
}

/// Drain the member's queue into the socket. A kick cancels the token; what
/// is already queued (including the kick notice) is flushed before closing.
async fn write_loop(mut sender: WsSink, mut rx: mpsc::Receiver<ChannelEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(event) = event else { break };
                if write_event(&mut sender, &event).await.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    if write_event(&mut sender, &event).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

/// Wait for the client to answer a password prompt. `None` if it leaves.
async fn next_password(receiver: &mut WsStream, cancel: &CancellationToken) -> Option<String> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(ChannelRequest::ChannelPassword(pw)) = ChannelRequest::decode(text.as_str()) {
                        return Some(pw);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Admit the connection, retrying once if the room died under it and again
/// each time the client answers a password prompt.
async fn admit(
    state: &AppState,
    channel_name: &str,
    params: SocketParams,
    ip: &str,
    recipient: &Arc<MpscRecipient>,
    receiver: &mut WsStream,
    cancel: &CancellationToken,
) -> Option<(Arc<Channel>, MemberId)> {
    let mut password = params.password;
    let mut retried = false;
    loop {
        let channel = state.registry.get_or_create(channel_name);
        let req = JoinRequest {
            name: params.name.clone(),
            ip: ip.to_string(),
            password: password.clone(),
            recipient: recipient.clone(),
        };
        match channel.join(req).await {
            Ok(id) => return Some((channel, id)),
            Err(JoinError::Dead) if !retried => retried = true,
            Err(JoinError::PasswordRequired) => {
                state.registry.release(&channel).await;
                password = Some(next_password(receiver, cancel).await?);
            }
            Err(e) => {
                debug!(channel = %channel_name, name = %params.name, error = %e, "join refused");
                state.registry.release(&channel).await;
                return None;
            }
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    channel_name: String,
    params: SocketParams,
    ip: String,
) {
    let (sender, mut receiver) = socket.split();

    // Bounded queue so a slow client can't grow memory without limit
    let (tx, rx) = mpsc::channel::<ChannelEvent>(MAX_OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();
    let recipient = Arc::new(MpscRecipient::new(tx, cancel.clone()));
    let send_task = tokio::spawn(write_loop(sender, rx, cancel.clone()));

    let name = params.name.clone();
    let Some((channel, id)) = admit(
        &state,
        &channel_name,
        params,
        &ip,
        &recipient,
        &mut receiver,
        &cancel,
    )
    .await
    else {
        cancel.cancel();
        let _ = send_task.await;
        return;
    };
    info!(channel = %channel.key(), name = %name, "socket attached");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => match ChannelRequest::decode(text.as_str()) {
                        Some(request) => channel.handle(id, request),
                        None => debug!(channel = %channel.key(), "dropping malformed frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.registry.leave(&channel, id).await;
    cancel.cancel();
    let _ = send_task.await;
    info!(channel = %channel.key(), name = %name, "socket closed");
}
