use chrono::{Duration, Utc};
use std::sync::Arc;

use classguard_core::{
    bypass::BypassCache,
    config::{AgentConfig, BlockPages, IdentityConfig},
    host::memory::InMemoryHost,
    mode::{PauseTransition, SessionModeController},
    pattern::matches,
    reconcile::{SessionReconciler, SweepContext},
    state::StateActor,
    Agent, AgentParts, Mode, PolicySnapshot,
};
use classguard_integrations::{FixtureBackend, PolicyDocument, StaticIdentity};
use classguard_storage::Database;

const STUDENT: &str = "ada@school.test";

fn snapshot(json: &str) -> PolicySnapshot {
    let doc: PolicyDocument = serde_json::from_str(json).unwrap();
    let mut snapshot = PolicySnapshot::default();
    snapshot.apply_document(&doc);
    snapshot
}

#[test]
fn test_glob_matching() {
    assert!(matches("http://a.example.com/x", "*://*.example.com/*"));
    assert!(!matches("http://example.com.evil.net", "*.example.com"));
    assert!(matches("HTTPS://A.Example.COM/X", "*://*.example.com/*"));
    assert!(!matches("https://a.test/", ""));
}

#[test]
fn test_mode_precedence() {
    let mut snap = snapshot(r#"{"paused": true, "focus_mode": true}"#);
    assert_eq!(snap.mode(), Mode::Paused);

    snap.exam_mode = true;
    snap.exam_url = "https://quiz.exams.test/".to_string();
    assert_eq!(
        snap.mode(),
        Mode::Exam {
            url: "https://quiz.exams.test/".to_string()
        }
    );

    let focus = snapshot(r#"{"focus_mode": true}"#);
    assert_eq!(focus.mode(), Mode::Focus);
    assert_eq!(snapshot("{}").mode(), Mode::Normal);
}

#[test]
fn test_bypass_lifetime() {
    let now = Utc::now();
    let mut cache = BypassCache::default();
    cache.grant("https://a.test/", now);

    assert!(cache.is_active("https://a.test/", now));
    assert!(cache.is_active("https://a.test/", now + Duration::minutes(9)));
    assert!(!cache.is_active("https://a.test/", now + Duration::minutes(10)));
    assert!(!cache.is_active("https://b.test/", now));
}

#[tokio::test]
async fn test_pause_round_trip_within_and_after_window() {
    let controller = SessionModeController::new(BlockPages::default());
    for (elapsed, expected) in [(Duration::minutes(59), 2), (Duration::minutes(61), 0)] {
        let host = InMemoryHost::with_urls(&["https://a.test/", "https://b.test/"]);
        let state = StateActor::spawn(Database::in_memory().unwrap());
        let now = Utc::now();

        state.update(|s| s.snapshot.paused = true).await.unwrap();
        controller.sync_pause(&host, &state, now).await.unwrap();
        state.update(|s| s.snapshot.paused = false).await.unwrap();
        let released = controller
            .sync_pause(&host, &state, now + elapsed)
            .await
            .unwrap();

        assert_eq!(released, PauseTransition::Released { restored: expected });
        let http = host.sessions().iter().filter(|s| s.is_http()).count();
        assert_eq!(http, expected);
    }
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let snap = snapshot(
        r#"{
            "teacher_blocks": ["*://*.games.example/*"],
            "categories": {"Video": {"urls": ["*://*.video.test/*"]}},
            "focus_mode": false
        }"#,
    );
    let host = InMemoryHost::with_urls(&[
        "https://play.games.example/a",
        "https://www.video.test/watch",
        "https://school.test/",
    ]);
    let bypass = BypassCache::default();
    let ctx = SweepContext {
        snapshot: &snap,
        bypass: &bypass,
        student: STUDENT,
        now: Utc::now(),
    };
    let reconciler = SessionReconciler::new(BlockPages::default());

    let first = reconciler.sweep(&host, &ctx).await.unwrap();
    assert_eq!(first.redirected, 2);
    let after_first = host.urls();

    let second = reconciler.sweep(&host, &ctx).await.unwrap();
    assert_eq!(second.redirected, 0);
    assert_eq!(second.restored, 0);
    assert_eq!(host.urls(), after_first);
}

#[tokio::test]
async fn test_full_cycle_with_fixture_backend() {
    let host = Arc::new(InMemoryHost::with_urls(&[
        "https://docs.example/file",
        "https://anything-else.test/",
    ]));
    let backend = Arc::new(FixtureBackend::new(
        serde_json::from_str(r#"{"focus_mode": true, "allowlist": ["*://*.docs.example/*"]}"#)
            .unwrap(),
    ));
    let agent = Agent::new(AgentParts {
        config: AgentConfig {
            identity: IdentityConfig {
                student_id: Some(STUDENT.to_string()),
                required_domain: None,
            },
            ..AgentConfig::default()
        },
        backend,
        host: host.clone(),
        rule_engine: host.clone(),
        identity: Arc::new(StaticIdentity::new(None)),
        state: StateActor::spawn(Database::in_memory().unwrap()),
    });

    agent.bootstrap(Utc::now()).await.unwrap();
    let outcome = agent.sync_cycle(Utc::now()).await.unwrap();

    assert_eq!(outcome.mode, Mode::Focus);
    assert_eq!(outcome.rules_installed, 1);
    assert_eq!(
        host.urls(),
        vec![
            "https://docs.example/file".to_string(),
            BlockPages::default().zero_trust
        ]
    );
    let rule = &host.rules()[0];
    assert_eq!(
        rule.condition.excluded_domains,
        vec!["docs.example", "blocked.classguard.example"]
    );
}
