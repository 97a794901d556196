use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::AgentError,
    host::{Session, SessionHost, SessionId, SessionQuery},
    state::StudentRecord,
};
use classguard_integrations::HeartbeatPayload;

/// Last screenshot taken of each open session.
#[derive(Debug, Default)]
pub struct ShotCache {
    shots: Mutex<BTreeMap<SessionId, String>>,
}

impl ShotCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SessionId, String>> {
        self.shots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: SessionId, data_url: String) {
        self.lock().insert(id, data_url);
    }

    /// Forget shots of sessions that are no longer open.
    pub fn retain_open(&self, open: &[SessionId]) {
        self.lock().retain(|id, _| open.contains(id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn to_wire(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|(id, shot)| (id.to_string(), shot.clone()))
            .collect()
    }
}

/// Gather the heartbeat: focused session, every session, a screenshot of the
/// visible session and the cached per-session shots.
///
/// # Errors
///
/// Returns the host error if sessions cannot be listed. A failed screenshot
/// only leaves the field empty.
pub async fn collect_heartbeat(
    host: &dyn SessionHost,
    student: &StudentRecord,
    shots: &ShotCache,
) -> Result<HeartbeatPayload, AgentError> {
    let sessions = host.list_sessions(&SessionQuery::All).await?;
    let active = sessions.iter().find(|s| s.active && s.is_http());

    let screenshot = match host.capture_visible().await {
        Ok(shot) => shot.unwrap_or_default(),
        Err(e) => {
            log::debug!("Screenshot unavailable: {e}");
            String::new()
        }
    };
    if let Some(active) = active.filter(|_| !screenshot.is_empty()) {
        shots.insert(active.id, screenshot.clone());
    }
    let open: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();
    shots.retain_open(&open);

    Ok(HeartbeatPayload {
        student: student.id.clone(),
        student_name: student.display_name.clone(),
        tab: active.map(Session::summary),
        tabs: sessions.iter().map(Session::summary).collect(),
        screenshot,
        tabshots: shots.to_wire(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::InMemoryHost;

    fn student() -> StudentRecord {
        StudentRecord {
            id: "ada@school.test".to_string(),
            display_name: "ada".to_string(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_payload() {
        let host = InMemoryHost::with_urls(&["https://a.test/", "chrome://newtab"]);
        host.set_screenshot(Some("data:image/png;base64,AAAA".to_string()));
        let shots = ShotCache::new();
        shots.insert(99, "stale".to_string());

        let payload = collect_heartbeat(&host, &student(), &shots).await.unwrap();
        assert_eq!(payload.student, "ada@school.test");
        assert_eq!(payload.student_name, "ada");
        assert_eq!(payload.tab.as_ref().unwrap().url, "https://a.test/");
        assert_eq!(payload.tabs.len(), 2);
        assert_eq!(payload.screenshot, "data:image/png;base64,AAAA");
        assert_eq!(payload.tabshots.len(), 1);
        assert!(payload.tabshots.contains_key("1"));
        assert_eq!(shots.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_without_screenshot() {
        let host = InMemoryHost::with_urls(&["chrome://newtab"]);
        let shots = ShotCache::new();

        let payload = collect_heartbeat(&host, &student(), &shots).await.unwrap();
        assert!(payload.tab.is_none());
        assert!(payload.screenshot.is_empty());
        assert!(shots.is_empty());
    }
}
