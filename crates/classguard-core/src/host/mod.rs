use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::AgentError, pattern::is_http_url};
use classguard_integrations::{Stroke, TabSummary};

pub mod bridge;
pub mod memory;

pub type SessionId = i64;

/// One open browsing session, as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub window_id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon_url: Option<String>,
}

impl Session {
    #[must_use]
    pub fn is_http(&self) -> bool {
        is_http_url(&self.url)
    }

    /// Browser-internal pages (settings, new tab, extensions) are never touched.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        !self.is_http()
    }

    #[must_use]
    pub fn summary(&self) -> TabSummary {
        TabSummary {
            id: Some(self.id),
            title: self.title.clone(),
            url: self.url.clone(),
            active: Some(self.active),
            favicon_url: self.favicon_url.clone(),
        }
    }
}

/// Request to open a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub url: String,
    pub pinned: bool,
    pub active: bool,
}

impl NewSession {
    #[must_use]
    pub fn background(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pinned: false,
            active: false,
        }
    }

    #[must_use]
    pub fn foreground(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pinned: false,
            active: true,
        }
    }
}

/// Which sessions to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum SessionQuery {
    All,
    /// Sessions whose URL is http or https.
    Http,
    /// The focused session of the focused window.
    Active,
}

impl SessionQuery {
    #[must_use]
    pub fn accepts(&self, session: &Session) -> bool {
        match self {
            Self::All => true,
            Self::Http => session.is_http(),
            Self::Active => session.active,
        }
    }
}

/// Message delivered to the in-page agent of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageMessage {
    PolicyPush {
        policy: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        scenes: Option<serde_json::Value>,
    },
    Poll {
        id: serde_json::Value,
        question: String,
        options: serde_json::Value,
    },
    AttentionCheck {
        title: String,
        timeout: u32,
    },
    ExamOverlayOn,
    ExamOverlayOff,
    Announcement {
        message: String,
    },
    FocusBanner,
    Whiteboard {
        strokes: Vec<Stroke>,
    },
}

impl PageMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PolicyPush { .. } => "policy_push",
            Self::Poll { .. } => "poll",
            Self::AttentionCheck { .. } => "attention_check",
            Self::ExamOverlayOn => "exam_overlay_on",
            Self::ExamOverlayOff => "exam_overlay_off",
            Self::Announcement { .. } => "announcement",
            Self::FocusBanner => "focus_banner",
            Self::Whiteboard { .. } => "whiteboard",
        }
    }
}

/// System notification shown to the student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub require_interaction: bool,
}

impl Notification {
    #[must_use]
    pub fn new(title: &str, message: &str) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            require_interaction: false,
        }
    }

    #[must_use]
    pub const fn sticky(mut self) -> Self {
        self.require_interaction = true;
        self
    }
}

/// The browser (or a stand-in) whose sessions the agent controls.
///
/// Every call may fail independently; callers treat failures per session.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// List open sessions matching `query`
    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, AgentError>;

    /// Open a new session
    async fn create_session(&self, session: &NewSession) -> Result<Session, AgentError>;

    /// Point an existing session at `url`
    async fn navigate(&self, id: SessionId, url: &str) -> Result<(), AgentError>;

    /// Focus a session
    async fn activate(&self, id: SessionId) -> Result<(), AgentError>;

    /// Close sessions
    async fn remove_sessions(&self, ids: &[SessionId]) -> Result<(), AgentError>;

    async fn send_page_message(
        &self,
        id: SessionId,
        message: &PageMessage,
    ) -> Result<(), AgentError>;

    async fn notify(&self, notification: &Notification) -> Result<(), AgentError>;

    /// Screenshot of the visible session as a data URL, if the host can take one
    async fn capture_visible(&self) -> Result<Option<String>, AgentError>;
}

/// Send `message` to every http(s) session, ignoring per-session failures.
///
/// Returns how many sessions accepted the message.
pub async fn broadcast(host: &dyn SessionHost, message: &PageMessage) -> usize {
    let sessions = match host.list_sessions(&SessionQuery::Http).await {
        Ok(sessions) => sessions,
        Err(e) => {
            log::debug!("Cannot list sessions for {}: {e}", message.kind());
            return 0;
        }
    };

    let mut delivered = 0;
    for session in &sessions {
        match host.send_page_message(session.id, message).await {
            Ok(()) => delivered += 1,
            Err(e) => log::debug!("{} not delivered to {}: {e}", message.kind(), session.id),
        }
    }
    delivered
}

/// The focused http(s) session, if any.
///
/// # Errors
///
/// Returns the host error if listing fails.
pub async fn active_http_session(host: &dyn SessionHost) -> Result<Option<Session>, AgentError> {
    Ok(host
        .list_sessions(&SessionQuery::Active)
        .await?
        .into_iter()
        .find(Session::is_http))
}
