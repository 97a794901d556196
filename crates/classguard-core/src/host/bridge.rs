//! Browser native-messaging bridge.
//!
//! Each frame is a native-endian `u32` length followed by that many bytes of
//! UTF-8 JSON. Requests carry a numeric `id` and an `op`; the browser side
//! answers with `{"id", "ok", "result" | "error"}`. Frames with an `event`
//! field are unsolicited host events.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

use super::{NewSession, Notification, PageMessage, Session, SessionHost, SessionId, SessionQuery};
use crate::{
    error::AgentError,
    rules::{CompiledRule, RuleEngine},
};
use classguard_integrations::IdentityProvider;

/// Upper bound on an inbound frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read one frame. `Ok(None)` means the peer closed the pipe cleanly.
///
/// # Errors
///
/// Returns an error on a truncated frame, an oversized length, or an I/O failure.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_ne_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one frame and flush.
///
/// # Errors
///
/// Returns an error if the payload is longer than `u32::MAX` or the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_ne_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Unsolicited event raised by the browser side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// The student submitted a bypass code on a block page.
    BypassAttempt {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        code: String,
        #[serde(default)]
        url: String,
    },
    PollAnswer {
        #[serde(default)]
        poll_id: Value,
        #[serde(default)]
        answer: Value,
    },
    AnnouncementDismissed {
        #[serde(default)]
        message: String,
    },
    /// The browser profile signed in or out.
    SignInChanged,
    /// A session finished loading a new URL.
    NavigationCompleted {
        session_id: SessionId,
        #[serde(default)]
        url: String,
    },
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock_pending(pending: &PendingReplies) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`SessionHost`] and [`RuleEngine`] backed by a native-messaging pipe.
pub struct NativeMessagingHost {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingReplies,
    next_id: AtomicU64,
    timeout: Duration,
}

impl NativeMessagingHost {
    /// Start the reader and writer tasks over an arbitrary pipe.
    ///
    /// The returned receiver yields host events and closes when the pipe does.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, pending.clone(), events_tx));

        let host = Self {
            outbound,
            pending,
            next_id: AtomicU64::new(0),
            timeout,
        };
        (host, events_rx)
    }

    /// Bridge over the process's stdin and stdout.
    #[must_use]
    pub fn stdio(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout(), timeout)
    }

    async fn call(&self, op: &'static str, args: Value) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut request = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        request.insert("id".to_string(), id.into());
        request.insert("op".to_string(), op.into());
        let payload =
            serde_json::to_vec(&Value::Object(request)).map_err(|e| AgentError::host(op, e))?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        if self.outbound.send(payload).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(AgentError::host(op, "host pipe closed"));
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(AgentError::host(op, "host pipe closed")),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                return Err(AgentError::host(op, "timed out waiting for host"));
            }
        };

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(AgentError::host(
                op,
                reply.error.unwrap_or_else(|| "host reported failure".to_string()),
            ))
        }
    }

    async fn call_decode<T>(&self, op: &'static str, args: Value) -> Result<T, AgentError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let result = self.call(op, args).await?;
        serde_json::from_value(result).map_err(|e| AgentError::host(op, e))
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            log::error!("Host pipe write failed: {e}");
            break;
        }
    }
}

async fn read_loop<R>(mut reader: R, pending: PendingReplies, events: mpsc::UnboundedSender<HostEvent>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Host closed the message pipe");
                break;
            }
            Err(e) => {
                log::error!("Host pipe read failed: {e}");
                break;
            }
        };

        let value: Value = match serde_json::from_slice(&frame) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Dropping undecodable host frame: {e}");
                continue;
            }
        };

        if value.get("event").is_some() {
            match serde_json::from_value::<HostEvent>(value) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        log::debug!("Host event dropped, nobody is listening");
                    }
                }
                Err(e) => log::debug!("Ignoring unrecognized host event: {e}"),
            }
            continue;
        }

        match serde_json::from_value::<Reply>(value) {
            Ok(reply) => {
                let waiter = lock_pending(&pending).remove(&reply.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => log::debug!("Late reply for request {}", reply.id),
                }
            }
            Err(e) => log::warn!("Dropping malformed host reply: {e}"),
        }
    }

    // Wake every caller still waiting
    lock_pending(&pending).clear();
}

#[async_trait]
impl SessionHost for NativeMessagingHost {
    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, AgentError> {
        let sessions: Vec<Session> = self
            .call_decode("list_sessions", json!({ "query": query }))
            .await?;
        Ok(sessions.into_iter().filter(|s| query.accepts(s)).collect())
    }

    async fn create_session(&self, session: &NewSession) -> Result<Session, AgentError> {
        self.call_decode("create_session", json!(session)).await
    }

    async fn navigate(&self, id: SessionId, url: &str) -> Result<(), AgentError> {
        self.call("update_session", json!({ "session_id": id, "url": url }))
            .await
            .map(|_| ())
    }

    async fn activate(&self, id: SessionId) -> Result<(), AgentError> {
        self.call("activate_session", json!({ "session_id": id }))
            .await
            .map(|_| ())
    }

    async fn remove_sessions(&self, ids: &[SessionId]) -> Result<(), AgentError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call("remove_sessions", json!({ "session_ids": ids }))
            .await
            .map(|_| ())
    }

    async fn send_page_message(
        &self,
        id: SessionId,
        message: &PageMessage,
    ) -> Result<(), AgentError> {
        self.call(
            "send_page_message",
            json!({ "session_id": id, "message": message }),
        )
        .await
        .map(|_| ())
    }

    async fn notify(&self, notification: &Notification) -> Result<(), AgentError> {
        self.call("notify", json!(notification)).await.map(|_| ())
    }

    async fn capture_visible(&self) -> Result<Option<String>, AgentError> {
        self.call_decode("capture_visible", json!({})).await
    }
}

#[async_trait]
impl RuleEngine for NativeMessagingHost {
    async fn installed_rule_ids(&self) -> Result<Vec<u32>, AgentError> {
        self.call_decode("get_rule_ids", json!({})).await
    }

    async fn remove_rules(&self, ids: &[u32]) -> Result<(), AgentError> {
        self.call("update_rules", json!({ "remove_rule_ids": ids }))
            .await
            .map(|_| ())
    }

    async fn add_rules(&self, rules: &[CompiledRule]) -> Result<(), AgentError> {
        self.call("update_rules", json!({ "add_rules": rules }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl IdentityProvider for NativeMessagingHost {
    async fn resolve_email(&self) -> Option<String> {
        match self
            .call_decode::<Option<String>>("get_profile_email", json!({}))
            .await
        {
            Ok(email) => email.filter(|e| !e.trim().is_empty()),
            Err(e) => {
                log::warn!("Profile email lookup failed: {e}");
                None
            }
        }
    }
}
