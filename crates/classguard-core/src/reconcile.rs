//! Reconciliation sweep over already-open sessions.
//!
//! Redirect rules only catch new navigations. The sweep walks every open
//! session and corrects the ones that violate the current policy. Planning is
//! pure; [`SessionReconciler::sweep`] then applies the plan best-effort.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::{form_urlencoded, Url};

use crate::{
    bypass::BypassCache,
    config::BlockPages,
    error::AgentError,
    host::{Session, SessionHost, SessionId, SessionQuery},
    pattern::{PatternSet, UrlParts},
    policy::{CategoryRules, Mode, PolicySnapshot},
    rules::{exam_hosts, focus_hosts},
};

/// Inputs of one sweep, read from agent state at the start of the cycle.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext<'a> {
    pub snapshot: &'a PolicySnapshot,
    pub bypass: &'a BypassCache,
    pub student: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionReason {
    ExamLockout,
    Paused,
    FocusLockout,
    TeacherBlock,
    Category(String),
    /// Teacher blocks were lifted; send the session back where it was.
    Restore,
}

/// One planned navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub session_id: SessionId,
    pub from: String,
    pub target: String,
    pub reason: CorrectionReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub inspected: usize,
    pub redirected: usize,
    pub restored: usize,
    pub failed: usize,
}

/// Patterns and host sets derived from a snapshot once per sweep.
struct Prepared<'a> {
    mode: Mode,
    allowed_hosts: Vec<String>,
    teacher: PatternSet,
    categories: Vec<(&'a str, &'a CategoryRules, PatternSet)>,
}

#[derive(Debug, Clone)]
pub struct SessionReconciler {
    pages: BlockPages,
}

impl SessionReconciler {
    #[must_use]
    pub const fn new(pages: BlockPages) -> Self {
        Self { pages }
    }

    fn prepare<'a>(&self, snapshot: &'a PolicySnapshot) -> Prepared<'a> {
        let mode = snapshot.mode();
        let allowed_hosts = match &mode {
            Mode::Exam { url } => exam_hosts(url),
            Mode::Focus => focus_hosts(&snapshot.allowlist),
            Mode::Paused | Mode::Normal => Vec::new(),
        };
        // Patterns naming the block host itself would loop
        let usable = |p: &&String| !p.contains(&self.pages.always_allow_host);
        let teacher = PatternSet::compile(snapshot.teacher_blocks.iter().filter(usable));
        let categories = snapshot
            .categories
            .iter()
            .map(|(name, rules)| {
                let set = PatternSet::compile(rules.url_patterns.iter().filter(usable));
                (name.as_str(), rules, set)
            })
            .collect();

        Prepared {
            mode,
            allowed_hosts,
            teacher,
            categories,
        }
    }

    /// Decide which sessions must move, without touching the host.
    #[must_use]
    pub fn plan(&self, ctx: &SweepContext<'_>, sessions: &[Session]) -> Vec<Correction> {
        let prepared = self.prepare(ctx.snapshot);
        sessions
            .iter()
            .filter(|s| s.is_http())
            .filter_map(|s| self.judge(ctx, &prepared, s))
            .collect()
    }

    fn judge(
        &self,
        ctx: &SweepContext<'_>,
        prepared: &Prepared<'_>,
        session: &Session,
    ) -> Option<Correction> {
        let url = session.url.as_str();
        if ctx.bypass.is_active(url, ctx.now) {
            return None;
        }
        let parts = UrlParts::parse(url)?;
        let on_block_host = self.pages.is_always_allowed_host(&parts.host);
        let correction = |target: String, reason| Correction {
            session_id: session.id,
            from: url.to_string(),
            target,
            reason,
        };

        match &prepared.mode {
            Mode::Exam { .. } if !on_block_host && !parts.is_within(&prepared.allowed_hosts) => {
                return Some(correction(
                    self.pages.zero_trust.clone(),
                    CorrectionReason::ExamLockout,
                ));
            }
            Mode::Paused => {
                if self.pages.is_locked_page(url) {
                    return None;
                }
                return Some(correction(self.pages.locked.clone(), CorrectionReason::Paused));
            }
            Mode::Focus if !on_block_host && !parts.is_within(&prepared.allowed_hosts) => {
                return Some(correction(
                    self.pages.zero_trust.clone(),
                    CorrectionReason::FocusLockout,
                ));
            }
            _ => {}
        }

        if on_block_host || self.is_block_page(ctx.snapshot, url) {
            return self
                .restore_target(ctx.snapshot, url)
                .map(|target| correction(target, CorrectionReason::Restore));
        }

        if prepared.teacher.first_match(url).is_some() {
            return Some(correction(
                self.teacher_block_url(url, ctx.student, ctx.snapshot.active_policy_name()),
                CorrectionReason::TeacherBlock,
            ));
        }

        prepared
            .categories
            .iter()
            .find(|(_, _, set)| set.first_match(url).is_some())
            .map(|(name, rules, _)| {
                correction(
                    self.category_block_url(ctx, url, name, rules),
                    CorrectionReason::Category((*name).to_string()),
                )
            })
    }

    /// Whether `url` is already one of our block pages, wherever they are hosted.
    fn is_block_page(&self, snapshot: &PolicySnapshot, url: &str) -> bool {
        let category_base = snapshot
            .blocked_redirect
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.pages.blocked);
        (!category_base.is_empty() && url.starts_with(category_base))
            || (!self.pages.teacher_block.is_empty() && self.pages.is_teacher_block_page(url))
    }

    /// Original URL of a teacher-block page once no teacher blocks remain.
    fn restore_target(&self, snapshot: &PolicySnapshot, url: &str) -> Option<String> {
        if !snapshot.teacher_blocks.is_empty() || !self.pages.is_teacher_block_page(url) {
            return None;
        }
        let parsed = Url::parse(url).ok()?;
        let original = parsed
            .query_pairs()
            .find_map(|(k, v)| (k == "url").then(|| v.into_owned()))?;
        UrlParts::parse(&original).map(|_| original)
    }

    /// Teacher-block page for `url`.
    #[must_use]
    pub fn teacher_block_url(&self, url: &str, student: &str, policy: Option<&str>) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("url", url).append_pair("user", student);
        if let Some(policy) = policy {
            query.append_pair("policy", policy);
        }
        with_query(&self.pages.teacher_block, &query.finish())
    }

    /// Category block page for `url`.
    #[must_use]
    pub fn category_block_url(
        &self,
        ctx: &SweepContext<'_>,
        url: &str,
        name: &str,
        rules: &CategoryRules,
    ) -> String {
        let snapshot = ctx.snapshot;
        let base = snapshot
            .blocked_redirect
            .as_deref()
            .unwrap_or(&self.pages.blocked);
        let policy = snapshot.active_policy_name();
        let path = rules
            .path
            .as_deref()
            .or(rules.id.as_deref())
            .filter(|p| !p.is_empty());
        let category = Some(name)
            .filter(|n| !n.is_empty())
            .or(rules.display_name.as_deref());

        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("url", url).append_pair("user", ctx.student);
        if let Some(policy) = policy {
            query.append_pair("rule", &STANDARD.encode(policy));
        }
        if let Some(path) = path {
            query.append_pair("path", path);
        }
        if let Some(category) = category {
            query.append_pair("cat", category);
        }
        if let Some(policy) = policy {
            query.append_pair("policy", policy);
        }
        query.append_pair("bypass", if snapshot.bypass_enabled { "1" } else { "0" });
        with_query(base, &query.finish())
    }

    /// Apply [`Self::plan`] to the host. Per-session failures are counted and
    /// logged; only a failure to list sessions aborts the sweep.
    ///
    /// # Errors
    ///
    /// Returns the host error if the session list cannot be read.
    pub async fn sweep(
        &self,
        host: &dyn SessionHost,
        ctx: &SweepContext<'_>,
    ) -> Result<SweepReport, AgentError> {
        let sessions = host.list_sessions(&SessionQuery::Http).await?;
        let mut report = SweepReport {
            inspected: sessions.len(),
            ..SweepReport::default()
        };

        for correction in self.plan(ctx, &sessions) {
            match host.navigate(correction.session_id, &correction.target).await {
                Ok(()) => {
                    log::debug!(
                        "Session {} {:?}: {} -> {}",
                        correction.session_id,
                        correction.reason,
                        correction.from,
                        correction.target
                    );
                    if correction.reason == CorrectionReason::Restore {
                        report.restored += 1;
                    } else {
                        report.redirected += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Could not correct session {}: {e}", correction.session_id);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

fn with_query(base: &str, query: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{query}")
}
