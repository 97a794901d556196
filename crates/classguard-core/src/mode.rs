//! Session-mode side effects: the pause lock and exam sessions.
//!
//! Entering a locking mode saves the student's sessions before closing them;
//! leaving it restores them when the saved set is still within its window.
//! The saved set is deleted on exit whether or not it was restored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::BlockPages,
    error::AgentError,
    host::{NewSession, PageMessage, Session, SessionHost, SessionId, SessionQuery},
    pattern::UrlParts,
    policy::Mode,
    rules::exam_hosts,
    state::{AgentState, StateHandle},
};

#[must_use]
pub fn pause_retention() -> Duration {
    Duration::hours(1)
}

#[must_use]
pub fn exam_retention() -> Duration {
    Duration::hours(2)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub url: String,
    pub pinned: bool,
    pub was_active: bool,
}

/// Sessions captured before a locking mode, restorable for `retention_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSessionSet {
    pub sessions: Vec<SavedSession>,
    pub saved_at: DateTime<Utc>,
    pub retention_secs: i64,
}

impl SavedSessionSet {
    #[must_use]
    pub fn capture(sessions: &[Session], now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            sessions: sessions
                .iter()
                .map(|s| SavedSession {
                    url: s.url.clone(),
                    pinned: s.pinned,
                    was_active: s.active,
                })
                .collect(),
            saved_at: now,
            retention_secs: retention.num_seconds(),
        }
    }

    #[must_use]
    pub fn is_restorable(&self, now: DateTime<Utc>) -> bool {
        now - self.saved_at <= Duration::seconds(self.retention_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedSetKind {
    Pause,
    Exam,
}

/// What [`SessionModeController::sync_pause`] did this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTransition {
    Entered { saved: usize },
    Maintained { closed: usize, lock_created: bool },
    Released { restored: usize },
    Idle,
}

#[derive(Debug, Clone)]
pub struct SessionModeController {
    pages: BlockPages,
}

impl SessionModeController {
    #[must_use]
    pub const fn new(pages: BlockPages) -> Self {
        Self { pages }
    }

    /// Student sessions a locking mode saves and closes.
    fn lockable(&self, session: &Session) -> bool {
        session.is_http()
            && !self.pages.is_always_allowed_url(&session.url)
            && !self.pages.is_locked_page(&session.url)
    }

    /// Apply the pause lock transition for the current mode.
    ///
    /// Exam mode leaves the pause lock untouched until the exam ends.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or the host cannot list sessions.
    pub async fn sync_pause(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        now: DateTime<Utc>,
    ) -> Result<PauseTransition, AgentError> {
        let (mode, lock_applied) = state.read(|s| (s.mode(), s.lock_applied)).await?;
        match mode {
            Mode::Paused if !lock_applied => self.enter_pause(host, state, now).await,
            Mode::Paused => self.maintain_pause(host).await,
            Mode::Normal | Mode::Focus if lock_applied => {
                self.release_pause(host, state, now).await
            }
            _ => Ok(PauseTransition::Idle),
        }
    }

    async fn enter_pause(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        now: DateTime<Utc>,
    ) -> Result<PauseTransition, AgentError> {
        let sessions: Vec<Session> = host
            .list_sessions(&SessionQuery::All)
            .await?
            .into_iter()
            .filter(|s| self.lockable(s))
            .collect();
        let saved = SavedSessionSet::capture(&sessions, now, pause_retention());
        let count = saved.sessions.len();
        state
            .update(move |s| {
                s.pause_saved = Some(saved);
                s.lock_applied = true;
            })
            .await?;

        if let Err(e) = host
            .create_session(&NewSession::foreground(&self.pages.locked))
            .await
        {
            log::warn!("Could not open the locked page: {e}");
        }
        close_sessions(host, &ids_of(&sessions)).await;

        log::info!("Class paused: saved and closed {count} session(s)");
        Ok(PauseTransition::Entered { saved: count })
    }

    async fn maintain_pause(&self, host: &dyn SessionHost) -> Result<PauseTransition, AgentError> {
        let sessions = host.list_sessions(&SessionQuery::All).await?;

        let mut lock_created = false;
        if !sessions.iter().any(|s| self.pages.is_locked_page(&s.url)) {
            match host
                .create_session(&NewSession::foreground(&self.pages.locked))
                .await
            {
                Ok(_) => {
                    log::info!("Locked page was closed, reopened it");
                    lock_created = true;
                }
                Err(e) => log::warn!("Could not reopen the locked page: {e}"),
            }
        }

        let stray: Vec<Session> = sessions.into_iter().filter(|s| self.lockable(s)).collect();
        let closed = close_sessions(host, &ids_of(&stray)).await;
        Ok(PauseTransition::Maintained {
            closed,
            lock_created,
        })
    }

    async fn release_pause(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        now: DateTime<Utc>,
    ) -> Result<PauseTransition, AgentError> {
        let saved = state
            .update(|s| {
                s.lock_applied = false;
                s.pause_saved.take()
            })
            .await?;

        let restored = self.restore(host, saved, SavedSetKind::Pause, now).await;

        let locked: Vec<SessionId> = host
            .list_sessions(&SessionQuery::All)
            .await?
            .into_iter()
            .filter(|s| self.pages.is_locked_page(&s.url))
            .map(|s| s.id)
            .collect();
        close_sessions(host, &locked).await;

        log::info!("Class resumed: restored {restored} session(s)");
        Ok(PauseTransition::Released { restored })
    }

    /// Consume a saved set from state and reopen it if still within its window.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StateUnavailable`] if the state actor has stopped.
    pub async fn restore_saved(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        kind: SavedSetKind,
        now: DateTime<Utc>,
    ) -> Result<usize, AgentError> {
        let saved = state
            .update(move |s| match kind {
                SavedSetKind::Pause => s.pause_saved.take(),
                SavedSetKind::Exam => s.exam_saved.take(),
            })
            .await?;
        Ok(self.restore(host, saved, kind, now).await)
    }

    async fn restore(
        &self,
        host: &dyn SessionHost,
        saved: Option<SavedSessionSet>,
        kind: SavedSetKind,
        now: DateTime<Utc>,
    ) -> usize {
        let Some(set) = saved else {
            return 0;
        };
        if !set.is_restorable(now) {
            log::info!(
                "{kind:?} sessions saved at {} are past their window, dropping them",
                set.saved_at
            );
            return 0;
        }

        let mut restored = 0;
        for saved in &set.sessions {
            let session = NewSession {
                url: saved.url.clone(),
                pinned: saved.pinned,
                active: saved.was_active,
            };
            match host.create_session(&session).await {
                Ok(_) => restored += 1,
                Err(e) => log::warn!("Could not restore {}: {e}", saved.url),
            }
        }
        restored
    }

    /// Enter exam mode with `url` as the only open session.
    ///
    /// Returns `false` when the exam is already running on the same URL, so a
    /// re-delivered command does not overwrite the saved sessions. Switching to
    /// another URL keeps the saved sessions and closes the previous exam.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or the host cannot list sessions.
    pub async fn start_exam(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AgentError> {
        let url = url.trim().to_string();
        let (running, current) = state
            .read(|s| (s.snapshot.exam_mode, s.snapshot.exam_url.clone()))
            .await?;
        if running && current == url {
            log::debug!("Exam already running on {url}");
            return Ok(false);
        }

        let to_close: Vec<Session> = if running {
            let previous = exam_hosts(&current);
            let next = url.clone();
            state.update(move |s| s.snapshot.exam_url = next).await?;
            host.list_sessions(&SessionQuery::Http)
                .await?
                .into_iter()
                .filter(|s| {
                    self.lockable(s)
                        && s.url != url
                        && UrlParts::parse(&s.url).is_some_and(|p| p.is_within(&previous))
                })
                .collect()
        } else {
            let sessions: Vec<Session> = host
                .list_sessions(&SessionQuery::All)
                .await?
                .into_iter()
                .filter(|s| self.lockable(s))
                .collect();
            let saved = SavedSessionSet::capture(&sessions, now, exam_retention());
            let next = url.clone();
            state
                .update(move |s| {
                    s.exam_saved = Some(saved);
                    s.snapshot.exam_mode = true;
                    s.snapshot.exam_url = next;
                })
                .await?;
            sessions
        };

        self.open_exam(host, &url).await;
        close_sessions(host, &ids_of(&to_close)).await;

        log::info!("Exam started on {url}");
        Ok(true)
    }

    /// Reopen the exam session if the student closed it.
    ///
    /// Returns whether a session was opened. Outside exam mode this does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or the host cannot list sessions.
    pub async fn maintain_exam(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
    ) -> Result<bool, AgentError> {
        let Mode::Exam { url } = state.read(AgentState::mode).await? else {
            return Ok(false);
        };
        let hosts = exam_hosts(&url);
        let open = host
            .list_sessions(&SessionQuery::Http)
            .await?
            .iter()
            .any(|s| UrlParts::parse(&s.url).is_some_and(|p| p.is_within(&hosts)));
        if open {
            return Ok(false);
        }

        self.open_exam(host, &url).await;
        log::info!("Exam session was closed, reopened {url}");
        Ok(true)
    }

    async fn open_exam(&self, host: &dyn SessionHost, url: &str) {
        match host.create_session(&NewSession::foreground(url)).await {
            Ok(exam) => {
                if let Err(e) = host
                    .send_page_message(exam.id, &PageMessage::ExamOverlayOn)
                    .await
                {
                    log::debug!("Exam overlay not delivered: {e}");
                }
            }
            Err(e) => log::warn!("Could not open exam session {url}: {e}"),
        }
    }

    /// Leave exam mode and bring back the sessions saved when it started.
    ///
    /// Returns `None` if no exam was running.
    ///
    /// # Errors
    ///
    /// Returns an error if state is unavailable or the host cannot list sessions.
    pub async fn end_exam(
        &self,
        host: &dyn SessionHost,
        state: &StateHandle,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, AgentError> {
        let ended = state
            .update(|s| {
                if !s.snapshot.exam_mode {
                    return None;
                }
                s.snapshot.exam_mode = false;
                Some((
                    std::mem::take(&mut s.snapshot.exam_url),
                    s.exam_saved.take(),
                ))
            })
            .await?;
        let Some((exam_url, saved)) = ended else {
            log::debug!("exam_end without a running exam");
            return Ok(None);
        };

        let sessions = host.list_sessions(&SessionQuery::All).await?;
        for session in &sessions {
            if let Err(e) = host
                .send_page_message(session.id, &PageMessage::ExamOverlayOff)
                .await
            {
                log::debug!("Exam overlay-off not delivered to {}: {e}", session.id);
            }
        }

        let to_close: Vec<SessionId> = sessions
            .iter()
            .filter(|s| self.lockable(s) && s.url != exam_url)
            .map(|s| s.id)
            .collect();
        close_sessions(host, &to_close).await;

        let restored = self.restore(host, saved, SavedSetKind::Exam, now).await;
        log::info!("Exam ended: restored {restored} session(s)");
        Ok(Some(restored))
    }
}

fn ids_of(sessions: &[Session]) -> Vec<SessionId> {
    sessions.iter().map(|s| s.id).collect()
}

/// Close sessions one at a time so one failure does not keep the rest open.
/// Returns how many were closed.
pub(crate) async fn close_sessions(host: &dyn SessionHost, ids: &[SessionId]) -> usize {
    let mut closed = 0;
    for id in ids {
        match host.remove_sessions(&[*id]).await {
            Ok(()) => closed += 1,
            Err(e) => log::warn!("Could not close session {id}: {e}"),
        }
    }
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::memory::InMemoryHost,
        state::{AgentState, StateActor},
    };
    use classguard_storage::Database;

    fn controller() -> SessionModeController {
        SessionModeController::new(BlockPages::default())
    }

    fn state() -> StateHandle {
        StateActor::spawn(Database::in_memory().unwrap())
    }

    async fn set_paused(state: &StateHandle, paused: bool) {
        state.update(move |s| s.snapshot.paused = paused).await.unwrap();
    }

    #[test]
    fn test_saved_set_window() {
        let now = Utc::now();
        let set = SavedSessionSet::capture(&[], now, pause_retention());
        assert!(set.is_restorable(now + Duration::minutes(60)));
        assert!(!set.is_restorable(now + Duration::minutes(61)));
    }

    #[tokio::test]
    async fn test_pause_then_resume_restores_sessions() {
        let host = InMemoryHost::new();
        host.open("https://a.test/1", false);
        let pinned = host.open("https://b.test/2", true);
        host.set_pinned(pinned, true);
        host.open("chrome://settings", false);
        let before: Vec<SavedSession> = host
            .sessions()
            .iter()
            .filter(|s| s.is_http())
            .map(|s| SavedSession {
                url: s.url.clone(),
                pinned: s.pinned,
                was_active: s.active,
            })
            .collect();

        let state = state();
        let now = Utc::now();
        set_paused(&state, true).await;
        let entered = controller().sync_pause(&host, &state, now).await.unwrap();
        assert_eq!(entered, PauseTransition::Entered { saved: 2 });
        assert_eq!(
            host.urls(),
            vec!["chrome://settings".to_string(), BlockPages::default().locked]
        );

        set_paused(&state, false).await;
        let released = controller()
            .sync_pause(&host, &state, now + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(released, PauseTransition::Released { restored: 2 });

        let after: Vec<SavedSession> = host
            .sessions()
            .iter()
            .filter(|s| s.is_http())
            .map(|s| SavedSession {
                url: s.url.clone(),
                pinned: s.pinned,
                was_active: s.active,
            })
            .collect();
        assert_eq!(after, before);
        assert!(state.read(|s| s.pause_saved.is_none()).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_after_window_restores_nothing() {
        let host = InMemoryHost::with_urls(&["https://a.test/"]);
        let state = state();
        let now = Utc::now();
        set_paused(&state, true).await;
        controller().sync_pause(&host, &state, now).await.unwrap();

        set_paused(&state, false).await;
        let released = controller()
            .sync_pause(&host, &state, now + Duration::minutes(61))
            .await
            .unwrap();
        assert_eq!(released, PauseTransition::Released { restored: 0 });
        assert!(host.sessions().is_empty());
        assert!(state.read(|s| s.pause_saved.is_none()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_self_heals_locked_page() {
        let host = InMemoryHost::with_urls(&["https://a.test/"]);
        let state = state();
        let now = Utc::now();
        set_paused(&state, true).await;
        controller().sync_pause(&host, &state, now).await.unwrap();

        // Student closes the locked page and opens something else
        let locked: Vec<SessionId> = host.sessions().iter().map(|s| s.id).collect();
        host.remove_sessions(&locked).await.unwrap();
        host.open("https://sneaky.test/", true);

        let maintained = controller().sync_pause(&host, &state, now).await.unwrap();
        assert_eq!(
            maintained,
            PauseTransition::Maintained {
                closed: 1,
                lock_created: true
            }
        );
        assert_eq!(host.urls(), vec![BlockPages::default().locked]);

        let again = controller().sync_pause(&host, &state, now).await.unwrap();
        assert_eq!(
            again,
            PauseTransition::Maintained {
                closed: 0,
                lock_created: false
            }
        );
    }

    #[tokio::test]
    async fn test_exam_start_and_end() {
        let host = InMemoryHost::with_urls(&["https://a.test/", "https://b.test/"]);
        let state = state();
        let now = Utc::now();
        let exam = "https://quiz.exams.test/start";

        assert!(controller().start_exam(&host, &state, exam, now).await.unwrap());
        assert_eq!(host.urls(), vec![exam.to_string()]);
        let exam_id = host.sessions()[0].id;
        assert_eq!(host.messages(), vec![(exam_id, PageMessage::ExamOverlayOn)]);
        assert_eq!(
            state.read(AgentState::mode).await.unwrap(),
            Mode::Exam {
                url: exam.to_string()
            }
        );

        // Re-delivered command keeps the saved sessions
        assert!(!controller().start_exam(&host, &state, exam, now).await.unwrap());
        assert_eq!(host.sessions().len(), 1);

        host.open("https://cdn.exams.test/help", false);
        let restored = controller()
            .end_exam(&host, &state, now + Duration::minutes(90))
            .await
            .unwrap();
        assert_eq!(restored, Some(2));

        let mut urls = host.urls();
        urls.sort();
        assert_eq!(urls, vec!["https://a.test/", "https://b.test/", exam]);
        assert_eq!(state.read(AgentState::mode).await.unwrap(), Mode::Normal);
        assert!(host
            .messages()
            .iter()
            .any(|(id, m)| *id == exam_id && *m == PageMessage::ExamOverlayOff));

        assert_eq!(
            controller().end_exam(&host, &state, now).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_maintain_exam_reopens_only_when_missing() {
        let host = InMemoryHost::with_urls(&["https://a.test/"]);
        let state = state();
        let exam = "https://quiz.exams.test/start";

        assert!(!controller().maintain_exam(&host, &state).await.unwrap());
        assert_eq!(host.urls(), vec!["https://a.test/"]);

        controller()
            .start_exam(&host, &state, exam, Utc::now())
            .await
            .unwrap();
        // Another page on the exam's domain still counts
        let exam_id = host.sessions()[0].id;
        host.navigate(exam_id, "https://cdn.exams.test/page").await.unwrap();
        assert!(!controller().maintain_exam(&host, &state).await.unwrap());

        host.remove_sessions(&[exam_id]).await.unwrap();
        assert!(controller().maintain_exam(&host, &state).await.unwrap());
        assert_eq!(host.urls(), vec![exam.to_string()]);
        let reopened = host.sessions()[0].id;
        assert!(host
            .messages()
            .contains(&(reopened, PageMessage::ExamOverlayOn)));
    }

    #[tokio::test]
    async fn test_exam_end_after_two_hours_restores_nothing() {
        let host = InMemoryHost::with_urls(&["https://a.test/"]);
        let state = state();
        let now = Utc::now();
        controller()
            .start_exam(&host, &state, "https://quiz.exams.test/", now)
            .await
            .unwrap();

        let restored = controller()
            .end_exam(&host, &state, now + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(restored, Some(0));
        assert_eq!(host.urls(), vec!["https://quiz.exams.test/"]);
    }

    #[tokio::test]
    async fn test_exam_leaves_pause_lock_alone() {
        let host = InMemoryHost::with_urls(&["https://a.test/"]);
        let state = state();
        state
            .update(|s| {
                s.snapshot.paused = true;
                s.lock_applied = true;
                s.snapshot.exam_mode = true;
                s.snapshot.exam_url = "https://quiz.exams.test/".to_string();
            })
            .await
            .unwrap();

        let idle = controller().sync_pause(&host, &state, Utc::now()).await.unwrap();
        assert_eq!(idle, PauseTransition::Idle);
        assert_eq!(host.urls(), vec!["https://a.test/"]);
    }
}
