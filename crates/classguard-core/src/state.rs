//! Agent state and the actor that owns it.
//!
//! The loops never share memory: each read or mutation is a closure sent to a
//! single task that owns [`AgentState`], applies it in arrival order and
//! persists the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};

use crate::{
    bypass::BypassCache,
    error::AgentError,
    mode::SavedSessionSet,
    policy::{Mode, PolicySnapshot},
};
use classguard_integrations::{PolicyDocument, StudentIdentity};
use classguard_storage::Database;

/// Store key of the persisted state document.
pub const STATE_KEY: &str = "agent_state";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: String,
    pub display_name: String,
}

impl From<StudentIdentity> for StudentRecord {
    fn from(identity: StudentIdentity) -> Self {
        Self {
            id: identity.id,
            display_name: identity.display_name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct AgentState {
    pub student: Option<StudentRecord>,
    pub snapshot: PolicySnapshot,
    /// The pause lock has been applied for the current pause.
    pub lock_applied: bool,
    pub bypass: BypassCache,
    pub pause_saved: Option<SavedSessionSet>,
    pub exam_saved: Option<SavedSessionSet>,
    pub disabled_by_backend: bool,
    pub disabled_notified: bool,
    /// Reason the agent is in safe mode, if it is.
    pub safe_mode: Option<String>,
    pub last_class_active: bool,
    pub shown_announcements: BTreeSet<String>,
    pub dismissed_announcements: BTreeSet<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl AgentState {
    /// Apply a fetched policy document.
    pub fn apply_policy(&mut self, doc: &PolicyDocument, now: DateTime<Utc>) {
        self.snapshot.apply_document(doc);
        self.bypass.set_ttl_minutes(self.snapshot.bypass_ttl_minutes);
        self.last_sync = Some(now);
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.snapshot.mode()
    }

    #[must_use]
    pub fn student_id(&self) -> Option<&str> {
        self.student.as_ref().map(|s| s.id.as_str())
    }

    /// Whether `message` still needs to be shown.
    #[must_use]
    pub fn announcement_pending(&self, message: &str) -> bool {
        !message.trim().is_empty()
            && !self.shown_announcements.contains(message)
            && !self.dismissed_announcements.contains(message)
    }
}

type ReadJob = Box<dyn FnOnce(&AgentState) + Send>;
type Reply = Box<dyn FnOnce() + Send>;
type WriteJob = Box<dyn FnOnce(&mut AgentState) -> Reply + Send>;

enum StateRequest {
    Read(ReadJob),
    Write(WriteJob),
}

/// Cloneable handle to the state actor.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<StateRequest>,
}

impl StateHandle {
    /// Run `f` against the current state.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StateUnavailable`] if the actor has stopped.
    pub async fn read<F, T>(&self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce(&AgentState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: ReadJob = Box::new(move |state: &AgentState| {
            let _ = reply.send(f(state));
        });
        self.tx
            .send(StateRequest::Read(job))
            .await
            .map_err(|_| AgentError::StateUnavailable)?;
        rx.await.map_err(|_| AgentError::StateUnavailable)
    }

    /// Mutate the state with `f`. The new state is persisted before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StateUnavailable`] if the actor has stopped.
    pub async fn update<F, T>(&self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce(&mut AgentState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |state: &mut AgentState| {
            let out = f(state);
            Box::new(move || {
                let _ = reply.send(out);
            }) as Reply
        });
        self.tx
            .send(StateRequest::Write(job))
            .await
            .map_err(|_| AgentError::StateUnavailable)?;
        rx.await.map_err(|_| AgentError::StateUnavailable)
    }

    /// Copy of the whole state.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StateUnavailable`] if the actor has stopped.
    pub async fn snapshot(&self) -> Result<AgentState, AgentError> {
        self.read(AgentState::clone).await
    }
}

pub struct StateActor {
    store: Database,
    state: AgentState,
    rx: mpsc::Receiver<StateRequest>,
}

impl StateActor {
    /// Load persisted state from `store` and start the actor task.
    ///
    /// An unreadable state document is replaced by defaults.
    #[must_use]
    pub fn spawn(store: Database) -> StateHandle {
        let state = match store.get_document::<AgentState>(STATE_KEY) {
            Ok(Some(state)) => {
                log::info!("Restored agent state (mode: {})", state.mode());
                state
            }
            Ok(None) => AgentState::default(),
            Err(e) => {
                log::warn!("Discarding unreadable agent state: {e:#}");
                AgentState::default()
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let actor = Self { store, state, rx };
        tokio::spawn(actor.run());
        StateHandle { tx }
    }

    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            match request {
                StateRequest::Read(job) => job(&self.state),
                StateRequest::Write(job) => {
                    let reply = job(&mut self.state);
                    self.persist();
                    reply();
                }
            }
        }
        log::debug!("State actor stopped");
    }

    fn persist(&self) {
        if let Err(e) = self.store.put_document(STATE_KEY, &self.state) {
            log::warn!("Failed to persist agent state: {e:#}");
        }
    }
}
