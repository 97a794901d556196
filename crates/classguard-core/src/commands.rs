//! Execution of one-shot server commands and policy `pending` actions.
//!
//! Commands are pulled without acknowledgement, so handlers tolerate
//! re-delivery: exam start and end are no-ops when already applied.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};

use crate::{
    config::BlockPages,
    error::AgentError,
    host::{
        active_http_session, broadcast, NewSession, Notification, PageMessage, SessionHost,
        SessionId, SessionQuery,
    },
    mode::{close_sessions, SavedSetKind, SessionModeController},
    pattern::UrlPattern,
    reconcile::{SessionReconciler, SweepContext, SweepReport},
    rules::{self, RuleCompiler, RuleEngine},
    state::StateHandle,
    telemetry::ShotCache,
};
use classguard_integrations::{AgentCommand, HeartbeatPayload, PendingAction, PolicyBackend};

pub const DEFAULT_NOTIFY_TITLE: &str = "ClassGuard";
pub const DEFAULT_ATTENTION_TITLE: &str = "Are you there?";
pub const DEFAULT_ATTENTION_TIMEOUT_SECS: u32 = 30;

/// Delay between focusing a session and capturing it.
const CAPTURE_SETTLE: Duration = Duration::from_millis(300);

/// What the caller should do after a command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    Done,
    Skipped,
    /// Run a policy sync now.
    RefreshPolicy,
}

pub struct CommandExecutor {
    host: Arc<dyn SessionHost>,
    backend: Arc<dyn PolicyBackend>,
    rule_engine: Arc<dyn RuleEngine>,
    state: StateHandle,
    shots: Arc<ShotCache>,
    modes: SessionModeController,
    compiler: RuleCompiler,
    reconciler: SessionReconciler,
    pages: BlockPages,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(
        host: Arc<dyn SessionHost>,
        backend: Arc<dyn PolicyBackend>,
        rule_engine: Arc<dyn RuleEngine>,
        state: StateHandle,
        shots: Arc<ShotCache>,
        pages: BlockPages,
    ) -> Self {
        Self {
            host,
            backend,
            rule_engine,
            state,
            shots,
            modes: SessionModeController::new(pages.clone()),
            compiler: RuleCompiler::new(pages.clone()),
            reconciler: SessionReconciler::new(pages.clone()),
            pages,
        }
    }

    /// Run one command for `student`.
    ///
    /// # Errors
    ///
    /// Returns an error if a step the command depends on fails; the caller
    /// logs it and moves to the next command.
    pub async fn execute(
        &self,
        command: AgentCommand,
        student: &str,
        now: DateTime<Utc>,
    ) -> Result<CommandEffect, AgentError> {
        let host = self.host.as_ref();
        match command {
            AgentCommand::Notify { title, message } => {
                if title.is_none() && message.is_none() {
                    return Ok(CommandEffect::Skipped);
                }
                let title = title.unwrap_or_else(|| DEFAULT_NOTIFY_TITLE.to_string());
                host.notify(&Notification::new(&title, &message.unwrap_or_default()).sticky())
                    .await?;
            }
            AgentCommand::Announce { title, message } => {
                let Some(text) = message.or(title).filter(|t| !t.trim().is_empty()) else {
                    return Ok(CommandEffect::Skipped);
                };
                if !self.announce(&text).await? {
                    return Ok(CommandEffect::Skipped);
                }
            }
            AgentCommand::Poll {
                id,
                question,
                options,
            } => {
                let delivered = broadcast(
                    host,
                    &PageMessage::Poll {
                        id,
                        question,
                        options,
                    },
                )
                .await;
                log::debug!("Poll delivered to {delivered} session(s)");
            }
            AgentCommand::ExamStart { url } => {
                if url.trim().is_empty() {
                    return Ok(CommandEffect::Skipped);
                }
                if !self.modes.start_exam(host, &self.state, &url, now).await? {
                    return Ok(CommandEffect::Skipped);
                }
                self.reinstall_rules().await;
                self.sweep_logged(now).await;
            }
            AgentCommand::ExamEnd => {
                if self.modes.end_exam(host, &self.state, now).await?.is_none() {
                    return Ok(CommandEffect::Skipped);
                }
                self.reinstall_rules().await;
                self.sweep_logged(now).await;
            }
            AgentCommand::CloseTabs { pattern } => {
                if pattern.trim().is_empty() {
                    return Ok(CommandEffect::Skipped);
                }
                self.close_matching(&pattern).await?;
            }
            AgentCommand::Screencap { tab_id } => self.screencap(tab_id, student).await?,
            AgentCommand::OpenTabs { urls } => {
                self.open_background(&urls).await;
            }
            AgentCommand::AttentionCheck { title, timeout } => {
                let message = PageMessage::AttentionCheck {
                    title: title.unwrap_or_else(|| DEFAULT_ATTENTION_TITLE.to_string()),
                    timeout: timeout.unwrap_or(DEFAULT_ATTENTION_TIMEOUT_SECS),
                };
                broadcast(host, &message).await;
            }
            AgentCommand::FocusTab { url } => {
                if url.trim().is_empty() {
                    return Ok(CommandEffect::Skipped);
                }
                let session = host.create_session(&NewSession::foreground(&url)).await?;
                host.send_page_message(session.id, &PageMessage::FocusBanner)
                    .await?;
            }
            AgentCommand::WbDraw { strokes } => {
                let Some(active) = active_http_session(host).await? else {
                    return Ok(CommandEffect::Skipped);
                };
                host.send_page_message(active.id, &PageMessage::Whiteboard { strokes })
                    .await?;
            }
            AgentCommand::PolicyRefresh => return Ok(CommandEffect::RefreshPolicy),
            AgentCommand::Unknown => {
                log::debug!("Ignoring unknown command type");
                return Ok(CommandEffect::Skipped);
            }
        }
        Ok(CommandEffect::Done)
    }

    /// Run a batch in order. One failing command does not stop the rest.
    ///
    /// Returns whether any command asked for a policy refresh.
    pub async fn execute_all(
        &self,
        commands: Vec<AgentCommand>,
        student: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut refresh = false;
        for command in commands {
            let kind = command.kind();
            match self.execute(command, student, now).await {
                Ok(CommandEffect::RefreshPolicy) => refresh = true,
                Ok(CommandEffect::Done) => log::info!("Executed {kind} command"),
                Ok(CommandEffect::Skipped) => log::debug!("Skipped {kind} command"),
                Err(e) => log::warn!("{kind} command failed: {e}"),
            }
        }
        refresh
    }

    /// Apply the one-shot actions attached to a policy document.
    pub async fn apply_pending(&self, actions: Vec<PendingAction>, now: DateTime<Utc>) {
        for action in actions {
            match action {
                PendingAction::OpenTabs { urls } => {
                    self.open_background(&urls).await;
                }
                PendingAction::RestoreTabs => {
                    match self
                        .modes
                        .restore_saved(self.host.as_ref(), &self.state, SavedSetKind::Pause, now)
                        .await
                    {
                        Ok(n) => log::info!("Restored {n} saved session(s) on request"),
                        Err(e) => log::warn!("restore_tabs failed: {e}"),
                    }
                }
                PendingAction::CloseTabs => match self.host.list_sessions(&SessionQuery::Http).await
                {
                    Ok(sessions) => {
                        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();
                        let closed = close_sessions(self.host.as_ref(), &ids).await;
                        log::info!("Closed {closed} session(s) on request");
                    }
                    Err(e) => log::warn!("close_tabs failed: {e}"),
                },
                PendingAction::Unknown => {}
            }
        }
    }

    /// Show `message` in the focused session unless it was shown or dismissed before.
    ///
    /// Returns whether it was shown.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or the message cannot be delivered.
    pub async fn announce(&self, message: &str) -> Result<bool, AgentError> {
        let text = message.to_string();
        if !self
            .state
            .read(move |s| s.announcement_pending(&text))
            .await?
        {
            return Ok(false);
        }
        let Some(active) = active_http_session(self.host.as_ref()).await? else {
            log::debug!("No focused session for announcement yet");
            return Ok(false);
        };
        self.host
            .send_page_message(
                active.id,
                &PageMessage::Announcement {
                    message: message.to_string(),
                },
            )
            .await?;

        let text = message.to_string();
        self.state
            .update(move |s| {
                s.shown_announcements.insert(text);
            })
            .await?;
        Ok(true)
    }

    /// Compile and install the rules for the current snapshot. Failures are logged.
    pub async fn reinstall_rules(&self) {
        let snapshot = match self.state.read(|s| s.snapshot.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Cannot reinstall rules: {e}");
                return;
            }
        };
        let set = self.compiler.compile(&snapshot);
        if let Err(e) = rules::install(self.rule_engine.as_ref(), &set).await {
            log::warn!("Rule install for {} mode failed: {e}", set.mode);
        }
    }

    /// Run the reconciliation sweep against the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or sessions cannot be listed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AgentError> {
        let (snapshot, bypass, student) = self
            .state
            .read(|s| {
                (
                    s.snapshot.clone(),
                    s.bypass.clone(),
                    s.student_id().unwrap_or_default().to_string(),
                )
            })
            .await?;
        let ctx = SweepContext {
            snapshot: &snapshot,
            bypass: &bypass,
            student: &student,
            now,
        };
        self.reconciler.sweep(self.host.as_ref(), &ctx).await
    }

    async fn sweep_logged(&self, now: DateTime<Utc>) {
        match self.sweep(now).await {
            Ok(report) => log::debug!(
                "Post-command sweep: {} redirected, {} restored",
                report.redirected,
                report.restored
            ),
            Err(e) => log::warn!("Post-command sweep failed: {e}"),
        }
    }

    async fn open_background(&self, urls: &[String]) -> usize {
        let mut opened = 0;
        for url in urls.iter().filter(|u| !u.trim().is_empty()) {
            match self.host.create_session(&NewSession::background(url)).await {
                Ok(_) => opened += 1,
                Err(e) => log::warn!("Could not open {url}: {e}"),
            }
        }
        opened
    }

    async fn close_matching(&self, pattern: &str) -> Result<usize, AgentError> {
        let pattern = UrlPattern::compile(pattern)?;
        let sessions = self.host.list_sessions(&SessionQuery::All).await?;
        let mut closed = 0;
        for session in sessions.iter().filter(|s| pattern.is_match(&s.url)) {
            match self.host.navigate(session.id, &self.pages.tab_closed).await {
                Ok(()) => closed += 1,
                Err(e) => log::warn!("Could not close session {}: {e}", session.id),
            }
        }
        log::info!("Closed {closed} session(s) matching {}", pattern.as_str());
        Ok(closed)
    }

    async fn screencap(&self, tab_id: SessionId, student: &str) -> Result<(), AgentError> {
        self.host.activate(tab_id).await?;
        tokio::time::sleep(CAPTURE_SETTLE).await;
        let Some(shot) = self.host.capture_visible().await? else {
            log::debug!("Host returned no screenshot for session {tab_id}");
            return Ok(());
        };
        self.shots.insert(tab_id, shot.clone());
        self.backend
            .post_heartbeat(&HeartbeatPayload::tabshot(student, tab_id, shot))
            .await?;
        Ok(())
    }
}
