use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Policy document
// ============================================================================

/// Treat an explicit JSON `null` the same as an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Policy document returned by `POST /api/policy`.
///
/// Absent fields decode to falsy/empty values. `blocked_redirect` stays an
/// `Option` because absence there means "keep the previous target".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct PolicyDocument {
    #[serde(default, deserialize_with = "nullable")]
    pub paused: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub focus_mode: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub categories: BTreeMap<String, CategoryDocument>,
    #[serde(default)]
    pub blocked_redirect: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub allowlist: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub teacher_blocks: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub chat_enabled: bool,
    #[serde(default, rename = "class")]
    pub class_info: Option<ClassInfo>,
    #[serde(default, deserialize_with = "nullable")]
    pub bypass_enabled: bool,
    #[serde(default)]
    pub bypass_ttl_minutes: Option<u32>,
    #[serde(default)]
    pub active_policy: Option<ActivePolicyDocument>,
    /// Raw one-shot actions; decoded leniently by [`PolicyDocument::pending_actions`].
    #[serde(default, deserialize_with = "nullable")]
    pub pending: Vec<serde_json::Value>,
    #[serde(default)]
    pub announcement: Option<String>,
    /// Opaque scene data, forwarded untouched to in-page agents.
    #[serde(default)]
    pub scenes: Option<serde_json::Value>,
}

impl PolicyDocument {
    /// Decode the `pending` list, dropping entries without a recognizable `type`.
    #[must_use]
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.pending
            .iter()
            .filter_map(|raw| match serde_json::from_value::<PendingAction>(raw.clone()) {
                Ok(PendingAction::Unknown) => {
                    log::debug!("Ignoring unknown pending action: {raw}");
                    None
                }
                Ok(action) => Some(action),
                Err(e) => {
                    log::debug!("Ignoring malformed pending action ({e}): {raw}");
                    None
                }
            })
            .collect()
    }
}

/// One named category of blocked URL patterns.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CategoryDocument {
    #[serde(
        default,
        alias = "url_patterns",
        alias = "urlPatterns",
        deserialize_with = "nullable"
    )]
    pub urls: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
}

/// Policy currently active for the student.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ActivePolicyDocument {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub blocked_categories: Vec<String>,
}

/// Class session the student belongs to.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClassInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub active: bool,
}

/// One-shot action piggybacked on the policy response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingAction {
    OpenTabs {
        #[serde(default, deserialize_with = "nullable")]
        urls: Vec<String>,
    },
    RestoreTabs,
    CloseTabs,
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Commands
// ============================================================================

/// Envelope returned by `GET /api/commands/{student}`.
#[derive(Debug, Default, Deserialize)]
pub struct CommandsEnvelope {
    #[serde(default, deserialize_with = "nullable")]
    pub commands: Vec<serde_json::Value>,
}

impl CommandsEnvelope {
    /// Decode each command on its own so one bad entry does not drop the batch.
    #[must_use]
    pub fn into_commands(self) -> Vec<AgentCommand> {
        self.commands
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<AgentCommand>(raw.clone()) {
                Ok(cmd) => Some(cmd),
                Err(e) => {
                    log::warn!("Skipping malformed command ({e}): {raw}");
                    None
                }
            })
            .collect()
    }
}

/// A whiteboard stroke in normalized (0..1) viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Stroke {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// One-shot command pulled from the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Notify {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Announce {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Poll {
        #[serde(default)]
        id: serde_json::Value,
        #[serde(default)]
        question: String,
        #[serde(default)]
        options: serde_json::Value,
    },
    ExamStart {
        #[serde(default)]
        url: String,
    },
    ExamEnd,
    CloseTabs {
        #[serde(default)]
        pattern: String,
    },
    Screencap {
        #[serde(rename = "tabId", alias = "tab_id")]
        tab_id: i64,
    },
    OpenTabs {
        #[serde(default, deserialize_with = "nullable")]
        urls: Vec<String>,
    },
    AttentionCheck {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        timeout: Option<u32>,
    },
    FocusTab {
        #[serde(default)]
        url: String,
    },
    WbDraw {
        #[serde(default, deserialize_with = "nullable")]
        strokes: Vec<Stroke>,
    },
    PolicyRefresh,
    #[serde(other)]
    Unknown,
}

impl AgentCommand {
    /// Wire name of the command, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::Announce { .. } => "announce",
            Self::Poll { .. } => "poll",
            Self::ExamStart { .. } => "exam_start",
            Self::ExamEnd => "exam_end",
            Self::CloseTabs { .. } => "close_tabs",
            Self::Screencap { .. } => "screencap",
            Self::OpenTabs { .. } => "open_tabs",
            Self::AttentionCheck { .. } => "attention_check",
            Self::FocusTab { .. } => "focus_tab",
            Self::WbDraw { .. } => "wb_draw",
            Self::PolicyRefresh => "policy_refresh",
            Self::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Bypass / poll / off-task
// ============================================================================

/// Body of `POST /api/bypass`.
#[derive(Debug, Clone, Serialize)]
pub struct BypassRequest {
    pub code: String,
    pub url: String,
    pub user: String,
}

/// Decision from the bypass endpoint. Only `ok && allow` grants.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct BypassDecision {
    #[serde(default, deserialize_with = "nullable")]
    pub ok: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub allow: bool,
}

impl BypassDecision {
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        self.ok && self.allow
    }
}

/// Body of `POST /api/poll_response`.
#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    pub poll_id: serde_json::Value,
    pub answer: serde_json::Value,
    pub student: String,
}

/// Body of `POST /api/offtask/check`.
#[derive(Debug, Clone, Serialize)]
pub struct OfftaskCheck {
    pub student: String,
    pub url: String,
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Minimal description of one open session for telemetry.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TabSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(rename = "favIconUrl", skip_serializing_if = "Option::is_none")]
    pub favicon_url: Option<String>,
}

/// Body of `POST /api/heartbeat`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatPayload {
    pub student: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub student_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tabs: Vec<TabSummary>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub screenshot: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tabshots: BTreeMap<String, String>,
}

impl HeartbeatPayload {
    /// Heartbeat carrying a single on-demand screenshot.
    #[must_use]
    pub fn tabshot(student: &str, tab_id: i64, data_url: String) -> Self {
        let mut tabshots = BTreeMap::new();
        tabshots.insert(tab_id.to_string(), data_url);
        Self {
            student: student.to_string(),
            tabshots,
            ..Self::default()
        }
    }
}

/// Heartbeat reply. Only the global enable toggle is consumed.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub extension_enabled: Option<bool>,
}
