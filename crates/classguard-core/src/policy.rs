use classguard_integrations::{ClassInfo, PolicyDocument};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_BYPASS_TTL_MINUTES: u32 = 10;

/// Effective session mode, derived once per cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Normal,
    Paused,
    Focus,
    Exam { url: String },
}

impl Mode {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Paused => "paused",
            Self::Focus => "focus",
            Self::Exam { .. } => "exam",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exam { url } => write!(f, "exam ({url})"),
            other => f.write_str(other.name()),
        }
    }
}

/// URL patterns of one blocked category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub url_patterns: Vec<String>,
    pub path: Option<String>,
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePolicy {
    pub id: Option<String>,
    pub name: Option<String>,
    pub blocked_categories: Vec<String>,
}

/// Last applied policy plus the locally owned exam flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PolicySnapshot {
    pub paused: bool,
    pub focus_mode: bool,
    /// Set by `exam_start`, never by the policy document.
    pub exam_mode: bool,
    pub exam_url: String,
    pub categories: BTreeMap<String, CategoryRules>,
    pub teacher_blocks: Vec<String>,
    pub allowlist: Vec<String>,
    /// Category block page; `None` falls back to the configured default.
    pub blocked_redirect: Option<String>,
    pub bypass_enabled: bool,
    pub bypass_ttl_minutes: u32,
    pub active_policy: Option<ActivePolicy>,
    pub chat_enabled: bool,
    pub class_info: Option<ClassInfo>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            paused: false,
            focus_mode: false,
            exam_mode: false,
            exam_url: String::new(),
            categories: BTreeMap::new(),
            teacher_blocks: Vec::new(),
            allowlist: Vec::new(),
            blocked_redirect: None,
            bypass_enabled: false,
            bypass_ttl_minutes: DEFAULT_BYPASS_TTL_MINUTES,
            active_policy: None,
            chat_enabled: false,
            class_info: None,
        }
    }
}

impl PolicySnapshot {
    /// Effective mode by precedence EXAM > PAUSED > FOCUS > NORMAL.
    ///
    /// Exam mode only counts when an exam URL is known.
    #[must_use]
    pub fn mode(&self) -> Mode {
        if self.exam_mode && !self.exam_url.trim().is_empty() {
            Mode::Exam {
                url: self.exam_url.clone(),
            }
        } else if self.paused {
            Mode::Paused
        } else if self.focus_mode {
            Mode::Focus
        } else {
            Mode::Normal
        }
    }

    /// Overwrite the server-owned fields from a fetched document.
    ///
    /// Exam flags are kept. An absent `blocked_redirect` keeps the previous
    /// target and an absent TTL falls back to the default.
    pub fn apply_document(&mut self, doc: &PolicyDocument) {
        self.paused = doc.paused;
        self.focus_mode = doc.focus_mode;
        self.categories = doc
            .categories
            .iter()
            .map(|(name, cat)| {
                (
                    name.clone(),
                    CategoryRules {
                        url_patterns: cat.urls.clone(),
                        path: cat.path.clone(),
                        id: cat.id.clone(),
                        display_name: cat.name.clone(),
                    },
                )
            })
            .collect();
        if let Some(target) = doc.blocked_redirect.as_deref().filter(|t| !t.is_empty()) {
            self.blocked_redirect = Some(target.to_string());
        }
        self.allowlist.clone_from(&doc.allowlist);
        self.teacher_blocks.clone_from(&doc.teacher_blocks);
        self.chat_enabled = doc.chat_enabled;
        self.class_info.clone_from(&doc.class_info);
        self.bypass_enabled = doc.bypass_enabled;
        self.bypass_ttl_minutes = doc
            .bypass_ttl_minutes
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_BYPASS_TTL_MINUTES);
        self.active_policy = doc.active_policy.as_ref().map(|p| ActivePolicy {
            id: p.id.as_ref().map(|id| match id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            name: p.name.clone(),
            blocked_categories: p.blocked_categories.clone(),
        });
    }

    /// Drop every enforcement input. Used when the backend disables the agent
    /// or identity cannot be resolved.
    pub fn clear_enforcement(&mut self) {
        self.paused = false;
        self.focus_mode = false;
        self.exam_mode = false;
        self.exam_url.clear();
        self.allowlist.clear();
        self.teacher_blocks.clear();
    }

    #[must_use]
    pub fn active_policy_name(&self) -> Option<&str> {
        self.active_policy
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    #[must_use]
    pub fn class_active(&self) -> bool {
        self.class_info.as_ref().is_some_and(|c| c.active)
    }
}
