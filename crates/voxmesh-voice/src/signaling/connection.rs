//! Background WebSocket connection loop with auth and reconnect.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use voxmesh_common::VoiceError;

use super::channel::Shared;
use super::types::{SessionContext, SignalingConfig, SignalingEvent, TransportState};
use crate::protocol::{decode_inbound, InboundEvent, OutboundMessage};

/// Close code for a deliberate, clean shutdown.
const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Reported when a close frame carries no status code.
const NO_STATUS: u16 = 1005;

/// How one connection ended.
#[derive(Debug)]
enum Outcome {
    /// `close()` was called.
    Shutdown,
    /// The relay closed with 1000.
    NormalClosure,
    AuthRejected(String),
    /// Anything that should trigger a reconnect.
    Dropped { code: Option<u16>, reason: String },
    /// Retrying cannot help (e.g. unusable URL).
    Fatal(VoiceError),
}

// ---------------------------------------------------------------------------
// Connection Loop
// ---------------------------------------------------------------------------

pub(crate) async fn connection_loop(
    shared: Arc<Shared>,
    config: SignalingConfig,
    ctx: SessionContext,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut attempt: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        shared.set_state(if attempt == 0 {
            TransportState::Connecting
        } else {
            TransportState::Reconnecting
        });

        let outcome = run_connection(&shared, &config, &ctx, &mut outbound_rx, &mut attempt).await;

        match outcome {
            Outcome::Shutdown => break,
            Outcome::NormalClosure => {
                info!("relay closed the connection normally");
                shared.publish(SignalingEvent::Disconnected {
                    code: Some(NORMAL_CLOSURE),
                });
                break;
            }
            Outcome::AuthRejected(reason) => {
                error!(reason = %reason, "relay rejected credential");
                shared.record_error(VoiceError::Auth(reason.clone()));
                shared.publish(SignalingEvent::AuthFailed { reason });
                break;
            }
            Outcome::Fatal(err) => {
                error!(error = %err, "signaling channel cannot connect");
                shared.record_error(err.clone());
                shared.publish(SignalingEvent::TransportFailed(err));
                break;
            }
            Outcome::Dropped { code, reason } => {
                warn!(?code, reason = %reason, "signaling connection dropped");
                shared.record_error(VoiceError::Transport(reason));
                shared.publish(SignalingEvent::Disconnected { code });

                attempt += 1;
                let Some(delay) = config.reconnect.delay(attempt) else {
                    let err = VoiceError::TransportExhausted {
                        attempts: config.reconnect.max_attempts,
                    };
                    error!(error = %err, "giving up on signaling relay");
                    shared.record_error(err.clone());
                    shared.publish(SignalingEvent::TransportFailed(err));
                    break;
                };

                shared.set_attempt(attempt);
                shared.set_state(TransportState::Reconnecting);
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting in {:?}", delay
                );
                shared.publish(SignalingEvent::ReconnectScheduled { attempt, delay });

                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.set_state(TransportState::Closed);
    shared.subscribers.close();
    shared.finished.cancel();
}

/// Build the relay URL with the channel id as a query parameter.
pub(crate) fn relay_url(base: &str, channel_id: &str) -> Result<Url, VoiceError> {
    let mut url = Url::parse(base)
        .map_err(|e| VoiceError::Transport(format!("invalid relay url {base:?}: {e}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(VoiceError::Transport(format!(
            "relay url must use ws or wss, got {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("channelId", channel_id);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Single connection
// ---------------------------------------------------------------------------

async fn run_connection(
    shared: &Shared,
    config: &SignalingConfig,
    ctx: &SessionContext,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    attempt: &mut u32,
) -> Outcome {
    let url = match relay_url(&config.url, ctx.channel_id()) {
        Ok(url) => url,
        Err(e) => return Outcome::Fatal(e),
    };
    info!(host = url.host_str().unwrap_or(""), path = url.path(), "Connecting to voice relay");

    let connect = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    );
    let ws_stream = tokio::select! {
        _ = shared.shutdown.cancelled() => return Outcome::Shutdown,
        result = connect => match result {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                return Outcome::Dropped {
                    code: None,
                    reason: format!("connect failed: {e}"),
                }
            }
            Err(_elapsed) => {
                return Outcome::Dropped {
                    code: None,
                    reason: format!("connect timed out after {:?}", config.connect_timeout),
                }
            }
        },
    };

    // Anything queued for a previous connection is meaningless now.
    while outbound_rx.try_recv().is_ok() {}

    let (mut ws_write, mut ws_read) = ws_stream.split();
    shared.set_state(TransportState::Authenticating);

    let auth = OutboundMessage::Auth {
        token: ctx.credential().to_string(),
        channel_id: ctx.channel_id().to_string(),
    };
    let auth_text = match auth.encode(ctx.channel_id()) {
        Ok(text) => text,
        Err(e) => return Outcome::Fatal(VoiceError::Transport(format!("encode auth: {e}"))),
    };
    if let Err(e) = ws_write.send(WsMessage::Text(auth_text.into())).await {
        return Outcome::Dropped {
            code: None,
            reason: format!("failed to send auth: {e}"),
        };
    }

    let auth_deadline = tokio::time::sleep(config.connect_timeout);
    tokio::pin!(auth_deadline);
    let mut authenticated = false;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                if authenticated {
                    while let Ok(text) = outbound_rx.try_recv() {
                        if ws_write.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "leaving".into(),
                };
                let _ = ws_write.send(WsMessage::Close(Some(frame))).await;
                let _ = ws_write.close().await;
                return Outcome::Shutdown;
            }
            _ = &mut auth_deadline, if !authenticated => {
                return Outcome::Dropped {
                    code: None,
                    reason: format!("no auth response within {:?}", config.connect_timeout),
                };
            }
            Some(text) = outbound_rx.recv(), if authenticated => {
                if let Err(e) = ws_write.send(WsMessage::Text(text.into())).await {
                    return Outcome::Dropped {
                        code: Some(ABNORMAL_CLOSURE),
                        reason: format!("write failed: {e}"),
                    };
                }
            }
            frame = ws_read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = match decode_inbound(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(error = %e, "undecodable relay frame");
                            continue;
                        }
                    };
                    match event {
                        InboundEvent::AuthResponse { success: true, user_id, .. } => {
                            if authenticated {
                                debug!("duplicate auth-response ignored");
                                continue;
                            }
                            authenticated = true;
                            *attempt = 0;
                            shared.set_attempt(0);
                            shared.set_state(TransportState::Active);
                            info!(user_id = ?user_id, "authenticated with voice relay");
                            shared.publish(SignalingEvent::Authenticated { user_id });
                        }
                        InboundEvent::AuthResponse { success: false, error, .. } => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "auth rejected".into(),
                            };
                            let _ = ws_write.send(WsMessage::Close(Some(frame))).await;
                            return Outcome::AuthRejected(
                                error.unwrap_or_else(|| "credential rejected".into()),
                            );
                        }
                        event if authenticated => {
                            shared.publish(SignalingEvent::Message(event));
                        }
                        event => debug!(?event, "dropping frame received before auth"),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS);
                    if code == NORMAL_CLOSURE {
                        return Outcome::NormalClosure;
                    }
                    return Outcome::Dropped {
                        code: Some(code),
                        reason: format!("relay closed with code {code}"),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Outcome::Dropped {
                        code: Some(ABNORMAL_CLOSURE),
                        reason: format!("websocket error: {e}"),
                    };
                }
                None => {
                    return Outcome::Dropped {
                        code: Some(ABNORMAL_CLOSURE),
                        reason: "connection ended without a close frame".into(),
                    };
                }
            },
        }
    }
}
