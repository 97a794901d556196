//! Deterministic in-process host.
//!
//! Backs the `check` dry run and the reconciliation tests. Sessions live in a
//! single window; every call is recorded so callers can inspect what the agent
//! did.

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{NewSession, Notification, PageMessage, Session, SessionHost, SessionId, SessionQuery};
use crate::{
    error::AgentError,
    rules::{CompiledRule, RuleEngine},
};

#[derive(Debug, Default)]
struct Inner {
    sessions: Vec<Session>,
    next_id: SessionId,
    rules: Vec<CompiledRule>,
    messages: Vec<(SessionId, PageMessage)>,
    notifications: Vec<Notification>,
    screenshot: Option<String>,
    failing: HashSet<SessionId>,
}

#[derive(Debug, Default)]
pub struct InMemoryHost {
    inner: Mutex<Inner>,
}

impl InMemoryHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Host with one session per URL; the first one is focused.
    #[must_use]
    pub fn with_urls(urls: &[&str]) -> Self {
        let host = Self::new();
        for (i, url) in urls.iter().enumerate() {
            host.open(url, i == 0);
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session directly, bypassing the agent.
    pub fn open(&self, url: &str, active: bool) -> SessionId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        if active {
            for s in &mut inner.sessions {
                s.active = false;
            }
        }
        inner.sessions.push(Session {
            id,
            url: url.to_string(),
            pinned: false,
            active,
            window_id: 1,
            title: String::new(),
            favicon_url: None,
        });
        id
    }

    pub fn set_pinned(&self, id: SessionId, pinned: bool) {
        if let Some(s) = self.lock().sessions.iter_mut().find(|s| s.id == id) {
            s.pinned = pinned;
        }
    }

    /// Make every operation on `id` fail.
    pub fn fail_session(&self, id: SessionId) {
        self.lock().failing.insert(id);
    }

    pub fn set_screenshot(&self, data_url: Option<String>) {
        self.lock().screenshot = data_url;
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.lock().sessions.iter().map(|s| s.url.clone()).collect()
    }

    #[must_use]
    pub fn rules(&self) -> Vec<CompiledRule> {
        self.lock().rules.clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(SessionId, PageMessage)> {
        self.lock().messages.clone()
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().notifications.clone()
    }

    fn check(inner: &Inner, op: &'static str, id: SessionId) -> Result<(), AgentError> {
        if inner.failing.contains(&id) {
            return Err(AgentError::host(op, format!("session {id} refused")));
        }
        if !inner.sessions.iter().any(|s| s.id == id) {
            return Err(AgentError::host(op, format!("no session with id {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHost for InMemoryHost {
    async fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<Session>, AgentError> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .filter(|s| query.accepts(s))
            .cloned()
            .collect())
    }

    async fn create_session(&self, session: &NewSession) -> Result<Session, AgentError> {
        let id = self.open(&session.url, session.active);
        self.set_pinned(id, session.pinned);
        self.lock()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| AgentError::host("create_session", "session vanished"))
    }

    async fn navigate(&self, id: SessionId, url: &str) -> Result<(), AgentError> {
        let mut inner = self.lock();
        Self::check(&inner, "update_session", id)?;
        if let Some(s) = inner.sessions.iter_mut().find(|s| s.id == id) {
            s.url = url.to_string();
        }
        Ok(())
    }

    async fn activate(&self, id: SessionId) -> Result<(), AgentError> {
        let mut inner = self.lock();
        Self::check(&inner, "activate_session", id)?;
        for s in &mut inner.sessions {
            s.active = s.id == id;
        }
        Ok(())
    }

    async fn remove_sessions(&self, ids: &[SessionId]) -> Result<(), AgentError> {
        let mut inner = self.lock();
        let mut missing = Vec::new();
        for id in ids {
            if Self::check(&inner, "remove_sessions", *id).is_err() {
                missing.push(*id);
            }
        }
        inner
            .sessions
            .retain(|s| !ids.contains(&s.id) || missing.contains(&s.id));
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AgentError::host(
                "remove_sessions",
                format!("could not close {missing:?}"),
            ))
        }
    }

    async fn send_page_message(
        &self,
        id: SessionId,
        message: &PageMessage,
    ) -> Result<(), AgentError> {
        let mut inner = self.lock();
        Self::check(&inner, "send_page_message", id)?;
        inner.messages.push((id, message.clone()));
        Ok(())
    }

    async fn notify(&self, notification: &Notification) -> Result<(), AgentError> {
        self.lock().notifications.push(notification.clone());
        Ok(())
    }

    async fn capture_visible(&self) -> Result<Option<String>, AgentError> {
        Ok(self.lock().screenshot.clone())
    }
}

#[async_trait]
impl RuleEngine for InMemoryHost {
    async fn installed_rule_ids(&self) -> Result<Vec<u32>, AgentError> {
        Ok(self.lock().rules.iter().map(|r| r.id).collect())
    }

    async fn remove_rules(&self, ids: &[u32]) -> Result<(), AgentError> {
        self.lock().rules.retain(|r| !ids.contains(&r.id));
        Ok(())
    }

    async fn add_rules(&self, rules: &[CompiledRule]) -> Result<(), AgentError> {
        let mut inner = self.lock();
        if let Some(dup) = rules
            .iter()
            .find(|r| inner.rules.iter().any(|installed| installed.id == r.id))
        {
            return Err(AgentError::host(
                "update_rules",
                format!("rule id {} already installed", dup.id),
            ));
        }
        inner.rules.extend(rules.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_list() {
        let host = InMemoryHost::with_urls(&["https://a.test/", "chrome://newtab"]);
        let created = host
            .create_session(&NewSession::foreground("https://b.test/"))
            .await
            .unwrap();

        let http = host.list_sessions(&SessionQuery::Http).await.unwrap();
        assert_eq!(http.len(), 2);
        let active = host.list_sessions(&SessionQuery::Active).await.unwrap();
        assert_eq!(active, vec![created]);
    }

    #[tokio::test]
    async fn test_failures_are_per_session() {
        let host = InMemoryHost::with_urls(&["https://a.test/", "https://b.test/"]);
        host.fail_session(1);

        assert!(host.navigate(1, "https://x.test/").await.is_err());
        host.navigate(2, "https://x.test/").await.unwrap();
        assert!(host.navigate(99, "https://x.test/").await.is_err());

        assert!(host.remove_sessions(&[1, 2]).await.is_err());
        assert_eq!(host.urls(), vec!["https://a.test/"]);
    }

    #[tokio::test]
    async fn test_duplicate_rule_ids_rejected() {
        let host = InMemoryHost::new();
        let rule = CompiledRule {
            id: 1,
            priority: 1,
            condition: crate::rules::RuleCondition {
                url_filter: "|http*".to_string(),
                resource_types: vec![crate::rules::ResourceType::MainFrame],
                excluded_domains: Vec::new(),
            },
            redirect_target: "https://locked.test/".to_string(),
        };
        host.add_rules(&[rule.clone()]).await.unwrap();
        assert!(host.add_rules(&[rule]).await.is_err());
        assert_eq!(host.installed_rule_ids().await.unwrap(), vec![1]);
    }
}
