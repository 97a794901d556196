//! The agent: wiring of the policy loop, the heartbeat loop, host events and
//! the control socket around the shared state actor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Notify},
    time::interval,
};

use crate::{
    commands::CommandExecutor,
    config::AgentConfig,
    error::AgentError,
    host::{bridge::HostEvent, broadcast, Notification, PageMessage, SessionHost, SessionId},
    ipc::{self, AgentStatus, IpcRequest, IpcResponse, IpcService},
    mode::{PauseTransition, SessionModeController},
    pattern::is_http_url,
    policy::Mode,
    reconcile::SweepReport,
    rules::{self, RuleCompiler, RuleEngine},
    state::{StateHandle, StudentRecord},
    telemetry::{collect_heartbeat, ShotCache},
};
use classguard_integrations::{
    resolve_student, BypassRequest, IdentityError, IdentityProvider, OfftaskCheck, PolicyBackend,
    PollResponse,
};

const CLASS_ACTIVE_TITLE: &str = "Class session is active";
const DISABLED_TITLE: &str = "ClassGuard disabled";
const DISABLED_MESSAGE: &str = "Filtering has been turned off by your school.";
const SAFE_MODE_TITLE: &str = "ClassGuard could not verify your account";
const SAFE_MODE_MESSAGE: &str = "Sign in with your school account to continue.";

/// Collaborators the agent is built from.
pub struct AgentParts {
    pub config: AgentConfig,
    pub backend: Arc<dyn PolicyBackend>,
    pub host: Arc<dyn SessionHost>,
    pub rule_engine: Arc<dyn RuleEngine>,
    pub identity: Arc<dyn IdentityProvider>,
    pub state: StateHandle,
}

/// What one policy sync did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub mode: Mode,
    pub rules_installed: usize,
    pub pause: PauseTransition,
    /// The exam session was missing and has been reopened.
    pub exam_reopened: bool,
    pub sweep: SweepReport,
    /// Sessions that accepted the policy push.
    pub pushed: usize,
}

pub struct Agent {
    config: AgentConfig,
    backend: Arc<dyn PolicyBackend>,
    host: Arc<dyn SessionHost>,
    rule_engine: Arc<dyn RuleEngine>,
    identity: Arc<dyn IdentityProvider>,
    state: StateHandle,
    shots: Arc<ShotCache>,
    compiler: RuleCompiler,
    modes: SessionModeController,
    commands: CommandExecutor,
    shutdown_signal: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    refresh: Notify,
}

impl Agent {
    #[must_use]
    pub fn new(parts: AgentParts) -> Self {
        let AgentParts {
            config,
            backend,
            host,
            rule_engine,
            identity,
            state,
        } = parts;
        let pages = config.pages.clone();
        let shots = Arc::new(ShotCache::new());
        let commands = CommandExecutor::new(
            host.clone(),
            backend.clone(),
            rule_engine.clone(),
            state.clone(),
            shots.clone(),
            pages.clone(),
        );

        Self {
            backend,
            host,
            rule_engine,
            identity,
            state,
            shots,
            compiler: RuleCompiler::new(pages.clone()),
            modes: SessionModeController::new(pages),
            commands,
            shutdown_signal: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
            refresh: Notify::new(),
            config,
        }
    }

    #[must_use]
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn request_shutdown(&self) {
        self.shutdown_signal.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_signal.load(Ordering::SeqCst)
    }

    /// Resolve the student identity. On failure the agent enters safe mode:
    /// enforcement is cleared and both loops idle until the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::IdentityUnresolved`] when no acceptable identity exists.
    pub async fn bootstrap(&self, now: DateTime<Utc>) -> Result<StudentRecord, AgentError> {
        let email = match self
            .config
            .identity
            .student_id
            .clone()
            .filter(|id| !id.trim().is_empty())
        {
            Some(id) => Some(id),
            None => self.identity.resolve_email().await,
        };

        match resolve_student(
            email.as_deref(),
            self.config.identity.required_domain.as_deref(),
        ) {
            Ok(identity) => {
                let record = StudentRecord::from(identity);
                let stored = record.clone();
                self.state
                    .update(move |s| {
                        s.student = Some(stored);
                        s.safe_mode = None;
                    })
                    .await?;
                log::info!("Enforcing policy for {}", record.id);
                Ok(record)
            }
            Err(e) => {
                self.enter_safe_mode(&e.to_string(), now).await;
                Err(e.into())
            }
        }
    }

    async fn enter_safe_mode(&self, reason: &str, now: DateTime<Utc>) {
        log::warn!("Entering safe mode: {reason}");
        let reason = reason.to_string();
        let first = match self
            .state
            .update(move |s| {
                s.student = None;
                s.safe_mode.replace(reason).is_none()
            })
            .await
        {
            Ok(first) => first,
            Err(e) => {
                log::warn!("Cannot record safe mode: {e}");
                return;
            }
        };

        self.stand_down(now).await;
        if first {
            self.notify(SAFE_MODE_TITLE, SAFE_MODE_MESSAGE).await;
        }
    }

    /// Release every lock and remove every rule.
    async fn stand_down(&self, now: DateTime<Utc>) {
        let host = self.host.as_ref();
        if let Err(e) = self.modes.end_exam(host, &self.state, now).await {
            log::warn!("Could not end exam while standing down: {e}");
        }
        if let Err(e) = self.state.update(|s| s.snapshot.clear_enforcement()).await {
            log::warn!("Could not clear enforcement: {e}");
            return;
        }
        if let Err(e) = self.modes.sync_pause(host, &self.state, now).await {
            log::warn!("Could not release the pause lock: {e}");
        }
        if let Err(e) = rules::clear(self.rule_engine.as_ref()).await {
            log::warn!("Could not clear rules: {e}");
        }
    }

    async fn notify(&self, title: &str, message: &str) {
        if let Err(e) = self
            .host
            .notify(&Notification::new(title, message).sticky())
            .await
        {
            log::debug!("Notification not shown: {e}");
        }
    }

    /// Whether the loops should do anything right now.
    async fn is_enforcing(&self) -> bool {
        self.state
            .read(|s| s.student.is_some() && s.safe_mode.is_none() && !s.disabled_by_backend)
            .await
            .unwrap_or(false)
    }

    async fn require_student(&self) -> Result<StudentRecord, AgentError> {
        self.state
            .read(|s| s.student.clone())
            .await?
            .ok_or(AgentError::IdentityUnresolved(IdentityError::Missing))
    }

    /// One pass of the policy loop: fetch, apply, enforce, push.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::TransientNetwork`] when the policy cannot be
    /// fetched; nothing is changed in that case.
    pub async fn sync_cycle(&self, now: DateTime<Utc>) -> Result<SyncOutcome, AgentError> {
        let student = self.require_student().await?;
        let doc = self.backend.fetch_policy(&student.id).await?;

        let applied = doc.clone();
        let (mode, class_started) = self
            .state
            .update(move |s| {
                s.apply_policy(&applied, now);
                let active = s.snapshot.class_active();
                let started = active && !s.last_class_active;
                s.last_class_active = active;
                let class_name = s
                    .snapshot
                    .class_info
                    .as_ref()
                    .and_then(|c| c.name.clone())
                    .unwrap_or_default();
                (s.mode(), started.then_some(class_name))
            })
            .await?;

        self.commands.apply_pending(doc.pending_actions(), now).await;

        if let Some(class_name) = class_started {
            self.notify(CLASS_ACTIVE_TITLE, &class_name).await;
        }

        let rules_installed = self.install_rules().await;

        let pause = match self.modes.sync_pause(self.host.as_ref(), &self.state, now).await {
            Ok(transition) => transition,
            Err(e) => {
                log::warn!("Pause transition failed: {e}");
                PauseTransition::Idle
            }
        };

        let exam_reopened = self
            .modes
            .maintain_exam(self.host.as_ref(), &self.state)
            .await
            .unwrap_or_else(|e| {
                log::warn!("Exam session check failed: {e}");
                false
            });

        let sweep = self.sweep(now).await?;

        let pushed = match serde_json::to_value(&doc) {
            Ok(policy) => {
                let push = PageMessage::PolicyPush {
                    policy,
                    scenes: doc.scenes.clone(),
                };
                broadcast(self.host.as_ref(), &push).await
            }
            Err(e) => {
                log::warn!("Could not encode policy push: {e}");
                0
            }
        };

        if let Some(message) = doc.announcement.as_deref() {
            if let Err(e) = self.commands.announce(message).await {
                log::debug!("Announcement not shown: {e}");
            }
        }

        log::debug!(
            "Synced policy for {} in {mode} mode: {} redirected, {} restored",
            student.id,
            sweep.redirected,
            sweep.restored
        );
        Ok(SyncOutcome {
            mode,
            rules_installed,
            pause,
            exam_reopened,
            sweep,
            pushed,
        })
    }

    async fn install_rules(&self) -> usize {
        let snapshot = match self.state.read(|s| s.snapshot.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Cannot compile rules: {e}");
                return 0;
            }
        };
        let set = self.compiler.compile(&snapshot);
        match rules::install(self.rule_engine.as_ref(), &set).await {
            Ok(()) => set.rules.len(),
            Err(e) => {
                log::warn!("Rule install for {} mode failed: {e}", set.mode);
                0
            }
        }
    }

    /// Correct already-open sessions against the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or sessions cannot be listed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AgentError> {
        self.commands.sweep(now).await
    }

    /// Pull and run pending commands. Returns whether a sync was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the commands cannot be fetched.
    pub async fn command_cycle(&self, now: DateTime<Utc>) -> Result<bool, AgentError> {
        let student = self.require_student().await?;
        let commands = self.backend.fetch_commands(&student.id).await?;
        if commands.is_empty() {
            return Ok(false);
        }
        log::debug!("Fetched {} command(s)", commands.len());
        Ok(self.commands.execute_all(commands, &student.id, now).await)
    }

    async fn policy_tick(&self, now: DateTime<Utc>) {
        if !self.is_enforcing().await {
            return;
        }
        if let Err(e) = self.sync_cycle(now).await {
            log_cycle_error("Policy sync", &e);
        }
        match self.command_cycle(now).await {
            Ok(true) => {
                if let Err(e) = self.sync_cycle(now).await {
                    log_cycle_error("Requested policy sync", &e);
                }
            }
            Ok(false) => {}
            Err(e) => log_cycle_error("Command fetch", &e),
        }
    }

    /// Post telemetry and apply the backend's global toggle.
    ///
    /// # Errors
    ///
    /// Returns an error if sessions cannot be listed or the heartbeat fails.
    pub async fn heartbeat_cycle(&self, now: DateTime<Utc>) -> Result<(), AgentError> {
        let Some(student) = self
            .state
            .read(|s| s.student.clone().filter(|_| s.safe_mode.is_none()))
            .await?
        else {
            return Ok(());
        };

        let payload = collect_heartbeat(self.host.as_ref(), &student, &self.shots).await?;
        let active_url = payload.tab.as_ref().map(|t| t.url.clone());
        let reply = self.backend.post_heartbeat(&payload).await?;

        match reply.extension_enabled {
            Some(false) => self.disable(now).await?,
            Some(true) => self.enable().await?,
            None => {}
        }

        if let Some(url) = active_url.filter(|u| is_http_url(u)) {
            let backend = self.backend.clone();
            let check = OfftaskCheck {
                student: student.id,
                url,
            };
            tokio::spawn(async move {
                if let Err(e) = backend.check_offtask(&check).await {
                    log::debug!("Off-task check failed: {e}");
                }
            });
        }
        Ok(())
    }

    async fn disable(&self, now: DateTime<Utc>) -> Result<(), AgentError> {
        let (newly, notify) = self
            .state
            .update(|s| {
                let newly = !s.disabled_by_backend;
                s.disabled_by_backend = true;
                let notify = !s.disabled_notified;
                s.disabled_notified = true;
                (newly, notify)
            })
            .await?;
        if newly {
            log::info!("Backend disabled the agent");
            self.stand_down(now).await;
        }
        if notify {
            self.notify(DISABLED_TITLE, DISABLED_MESSAGE).await;
        }
        Ok(())
    }

    async fn enable(&self) -> Result<(), AgentError> {
        let was_disabled = self
            .state
            .update(|s| {
                let was = s.disabled_by_backend;
                s.disabled_by_backend = false;
                s.disabled_notified = false;
                was
            })
            .await?;
        if was_disabled {
            log::info!("Backend re-enabled the agent");
            self.refresh.notify_one();
        }
        Ok(())
    }

    /// React to an event raised by the browser side.
    pub async fn handle_event(&self, event: HostEvent, now: DateTime<Utc>) {
        let result = match event {
            HostEvent::BypassAttempt {
                session_id,
                code,
                url,
            } => self.exchange_bypass(session_id, &code, &url, now).await,
            HostEvent::PollAnswer { poll_id, answer } => self.answer_poll(poll_id, answer).await,
            HostEvent::AnnouncementDismissed { message } => self
                .state
                .update(move |s| {
                    s.dismissed_announcements.insert(message);
                })
                .await,
            HostEvent::SignInChanged => match self.bootstrap(now).await {
                Ok(_) => {
                    self.refresh.notify_one();
                    Ok(())
                }
                Err(e) => Err(e),
            },
            HostEvent::NavigationCompleted { session_id, url } => {
                log::debug!("Session {session_id} loaded {url}");
                if self.is_enforcing().await {
                    self.sweep(now).await.map(|_| ())
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            log::warn!("Host event failed: {e}");
        }
    }

    /// Exchange a bypass code; on a grant, reload the URL in the requesting session.
    async fn exchange_bypass(
        &self,
        session_id: Option<SessionId>,
        code: &str,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AgentError> {
        let code = code.trim();
        if code.is_empty() || url.is_empty() {
            log::info!("Bypass denied: missing code or URL");
            return Ok(());
        }
        let student = self.require_student().await?;
        let decision = self
            .backend
            .exchange_bypass(&BypassRequest {
                code: code.to_string(),
                url: url.to_string(),
                user: student.id,
            })
            .await?;
        if !decision.is_allowed() {
            log::info!("Bypass denied for {url}");
            return Ok(());
        }

        let granted = url.to_string();
        self.state
            .update(move |s| s.bypass.grant(&granted, now))
            .await?;
        log::info!("Bypass granted for {url}");
        if let Some(id) = session_id {
            self.host.navigate(id, url).await?;
        }
        Ok(())
    }

    async fn answer_poll(
        &self,
        poll_id: serde_json::Value,
        answer: serde_json::Value,
    ) -> Result<(), AgentError> {
        let student = self.require_student().await?;
        self.backend
            .post_poll_response(&PollResponse {
                poll_id,
                answer,
                student: student.id,
            })
            .await?;
        Ok(())
    }

    /// Snapshot of the agent for `classguard status`.
    pub async fn status(&self, now: DateTime<Utc>) -> AgentStatus {
        let rule_count = match self.rule_engine.installed_rule_ids().await {
            Ok(ids) => ids.len(),
            Err(e) => {
                log::debug!("Cannot count rules: {e}");
                0
            }
        };
        let running = !self.is_shutting_down();
        match self.state.snapshot().await {
            Ok(state) => AgentStatus {
                running,
                student: state.student_id().map(str::to_string),
                mode: state.mode().to_string(),
                enabled: !state.disabled_by_backend,
                safe_mode: state.safe_mode.clone(),
                last_sync: state.last_sync.map(|t| t.to_rfc3339()),
                rule_count,
                bypass_grants: state.bypass.active_count(now),
            },
            Err(e) => AgentStatus {
                running,
                safe_mode: Some(e.to_string()),
                rule_count,
                ..AgentStatus::default()
            },
        }
    }

    async fn policy_loop(self: Arc<Self>) {
        let secs = self.config.loops.policy_interval_secs.max(1);
        let mut ticker = interval(Duration::from_secs(secs));
        let mut shutdown = self.shutdown_tx.subscribe();
        while !self.is_shutting_down() {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.refresh.notified() => log::debug!("Immediate policy sync requested"),
                _ = shutdown.changed() => break,
            }
            self.policy_tick(Utc::now()).await;
        }
        log::debug!("Policy loop stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let secs = self.config.loops.heartbeat_interval_secs.max(1);
        let mut ticker = interval(Duration::from_secs(secs));
        let mut shutdown = self.shutdown_tx.subscribe();
        while !self.is_shutting_down() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            // Keeps running while disabled so the backend can re-enable us
            if let Err(e) = self.heartbeat_cycle(Utc::now()).await {
                log_cycle_error("Heartbeat", &e);
            }
        }
        log::debug!("Heartbeat loop stopped");
    }

    /// Run until Ctrl-C, an IPC shutdown or the host closing the event stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the control socket cannot be bound.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
        sock_path: &Path,
    ) -> Result<()> {
        let listener = ipc::bind(sock_path)
            .with_context(|| format!("Failed to bind {}", sock_path.display()))?;
        let service: Arc<dyn IpcService> = self.clone();
        let ipc_task = tokio::spawn(ipc::serve(listener, service));

        if let Err(e) = self.bootstrap(Utc::now()).await {
            log::warn!("Starting without an identity: {e}");
        }

        let policy = tokio::spawn(self.clone().policy_loop());
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        log::info!("Agent started with IPC on {}", sock_path.display());

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let agent = self.clone();
                        tokio::spawn(async move { agent.handle_event(event, Utc::now()).await });
                    }
                    None => {
                        log::info!("Host disconnected, shutting down...");
                        self.request_shutdown();
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received Ctrl-C, shutting down...");
                    self.request_shutdown();
                }
                _ = shutdown.changed() => {}
            }

            if self.is_shutting_down() {
                break;
            }
        }

        let _ = tokio::join!(policy, heartbeat);
        ipc_task.abort();
        remove_socket(sock_path);
        log::info!("Agent shut down gracefully.");
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::debug!("Could not remove {}: {e}", path.display());
    }
}

fn log_cycle_error(what: &str, e: &AgentError) {
    if e.is_transient() {
        log::warn!("{what} skipped: {e}");
    } else {
        log::error!("{what} failed: {e}");
    }
}

#[async_trait]
impl IpcService for Agent {
    async fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => IpcResponse::Status(self.status(Utc::now()).await),
            IpcRequest::Shutdown => {
                self.request_shutdown();
                IpcResponse::Shutdown
            }
            IpcRequest::RefreshIdentity => match self.bootstrap(Utc::now()).await {
                Ok(student) => {
                    self.refresh.notify_one();
                    IpcResponse::Identity {
                        ok: true,
                        student: Some(student.id),
                    }
                }
                Err(_) => IpcResponse::Identity {
                    ok: false,
                    student: None,
                },
            },
        }
    }
}

/// Default socket location inside `data_dir`.
#[must_use]
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ipc::SOCKET_NAME)
}

#[cfg(test)]
mod tests;
