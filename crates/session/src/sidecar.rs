//! [`ChatTransport`] over the chat-network sidecar's WebSocket protocol.
//!
//! The sidecar speaks JSON frames tagged by `type`. Requests that expect an
//! answer carry a `request_id`; the matching reply completes a pending
//! oneshot. Everything else is translated into [`TransportEvent`]s.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    futures::{SinkExt, StreamExt},
    parley_common::{DeliveryReceipt, Error, InboundEvent, Result, now_ms},
    parley_config::SessionConfig,
    serde::{Deserialize, Serialize},
    tokio::sync::{mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::transport::{ChatTransport, DisconnectReason, TransportEvent};

/// Frames sent to the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarRequest {
    Login,
    Logout,
    SendText {
        request_id: String,
        to: String,
        text: String,
    },
    Ping {
        request_id: String,
    },
    RefreshQr,
}

/// Frames received from the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
    Qr {
        qr: String,
    },
    Authenticated,
    Connected {
        #[serde(default)]
        phone_number: Option<String>,
    },
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    LoggedOut,
    InboundMessage {
        message_id: String,
        chat_jid: String,
        sender_jid: String,
        #[serde(default)]
        sender_name: Option<String>,
        #[serde(default)]
        is_group: bool,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        body: String,
        #[serde(default)]
        has_media: bool,
        /// Seconds since the Unix epoch.
        timestamp: u64,
    },
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Pong {
        request_id: String,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        error: String,
    },
}

impl SidecarEvent {
    fn request_id(&self) -> Option<&str> {
        match self {
            Self::SendResult { request_id, .. } | Self::Pong { request_id } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Translate an unsolicited frame. Replies and unknowns yield `None`.
    fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            Self::Qr { qr } => Some(TransportEvent::Credential(qr)),
            Self::Authenticated => Some(TransportEvent::Authenticated),
            Self::Connected { phone_number } => Some(TransportEvent::Ready {
                account: phone_number,
            }),
            Self::Disconnected { reason } => Some(TransportEvent::Disconnected(
                DisconnectReason::Other(reason.unwrap_or_else(|| "sidecar disconnected".into())),
            )),
            Self::LoggedOut => Some(TransportEvent::Disconnected(DisconnectReason::LoggedOut)),
            Self::InboundMessage {
                message_id,
                chat_jid,
                sender_jid,
                sender_name,
                is_group,
                from_me,
                body,
                has_media,
                timestamp,
            } => Some(TransportEvent::Message(InboundEvent {
                message_id,
                conversation_id: chat_jid,
                sender_id: sender_jid,
                sender_name,
                body,
                is_group,
                has_media,
                from_me,
                timestamp_ms: timestamp.saturating_mul(1_000),
            })),
            Self::Error { error, .. } => {
                warn!(error = %error, "sidecar reported an error");
                None
            },
            Self::SendResult { .. } | Self::Pong { .. } => None,
        }
    }
}

type Pending = Arc<DashMap<String, oneshot::Sender<SidecarEvent>>>;

struct Link {
    writer: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

/// WebSocket client for the chat-network sidecar.
pub struct SidecarTransport {
    url: String,
    request_timeout: Duration,
    link: Mutex<Option<Link>>,
    pending: Pending,
}

impl SidecarTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            url: config.sidecar_url.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            link: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Unlink the account on the sidecar. The next `open` starts pairing
    /// from scratch.
    pub async fn logout(&self) -> Result<()> {
        self.push(&SidecarRequest::Logout)
    }

    fn push(&self, request: &SidecarRequest) -> Result<()> {
        let text = serde_json::to_string(request)?;
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        let Some(link) = link.as_ref() else {
            return Err(Error::transport("sidecar connection is not open"));
        };
        link.writer
            .send(Message::Text(text.into()))
            .map_err(|_| Error::transport("sidecar connection closed"))
    }

    async fn call(&self, request_id: String, request: SidecarRequest) -> Result<SidecarEvent> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        if let Err(e) = self.push(&request) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(SidecarEvent::Error { error, .. })) => Err(Error::transport(error)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::transport("sidecar connection closed")),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(Error::transport(format!(
                    "sidecar did not answer within {}ms",
                    self.request_timeout.as_millis()
                )))
            },
        }
    }
}

#[async_trait]
impl ChatTransport for SidecarTransport {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        info!(url = %self.url, "connecting to sidecar");
        let (ws, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            Error::transport(format!("connecting to sidecar at {}: {e}", self.url))
        })?;
        let (mut sink, mut stream) = ws.split();

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Writer: forwards queued frames until the link is dropped.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    msg = write_rx.recv() => msg,
                };
                let Some(msg) = msg else { break };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "sidecar write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: routes replies to callers and everything else to the session.
        let reader_cancel = cancel.clone();
        let pending = Arc::clone(&self.pending);
        let pong_tx = write_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    () = reader_cancel.cancelled() => break DisconnectReason::Navigation,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let event: SidecarEvent = match serde_json::from_str(text.as_str()) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "ignoring malformed sidecar frame");
                                continue;
                            },
                        };
                        if let Some(id) = event.request_id()
                            && let Some((_, waiter)) = pending.remove(id)
                        {
                            let _ = waiter.send(event);
                            continue;
                        }
                        if let Some(ev) = event.into_transport_event()
                            && event_tx.send(ev).is_err()
                        {
                            break DisconnectReason::Navigation;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        break DisconnectReason::Other("sidecar closed the connection".into());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break DisconnectReason::Other(e.to_string()),
                }
            };
            // Dropping the senders fails every in-flight request.
            pending.clear();
            reader_cancel.cancel();
            if reason != DisconnectReason::Navigation {
                let _ = event_tx.send(TransportEvent::Disconnected(reason));
            }
        });

        {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = link.replace(Link {
                writer: write_tx,
                cancel,
            }) {
                old.cancel.cancel();
            }
        }

        self.push(&SidecarRequest::Login)?;
        Ok(event_rx)
    }

    async fn close(&self) -> Result<()> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            debug!(url = %self.url, "closing sidecar connection");
            let _ = link.writer.send(Message::Close(None));
            link.cancel.cancel();
        }
        Ok(())
    }

    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let reply = self
            .call(request_id.clone(), SidecarRequest::SendText {
                request_id: request_id.clone(),
                to: conversation_id.into(),
                text: text.into(),
            })
            .await?;
        match reply {
            SidecarEvent::SendResult {
                success: true,
                message_id,
                ..
            } => Ok(DeliveryReceipt {
                message_id: message_id.unwrap_or(request_id),
                conversation_id: conversation_id.into(),
                sent_at_ms: now_ms(),
            }),
            SidecarEvent::SendResult { error, .. } => Err(Error::transport(
                error.unwrap_or_else(|| "send rejected by sidecar".into()),
            )),
            other => Err(Error::transport(format!(
                "unexpected reply to send_text: {other:?}"
            ))),
        }
    }

    async fn ping(&self) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self
            .call(request_id.clone(), SidecarRequest::Ping { request_id })
            .await?
        {
            SidecarEvent::Pong { .. } => Ok(()),
            other => Err(Error::transport(format!(
                "unexpected reply to ping: {other:?}"
            ))),
        }
    }

    async fn refresh_credential(&self) -> Result<()> {
        self.push(&SidecarRequest::RefreshQr)
    }
}
