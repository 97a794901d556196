use super::*;
use crate::{
    config::{BlockPages, IdentityConfig},
    host::memory::InMemoryHost,
    policy::PolicySnapshot,
    state::{AgentState, StateActor},
};
use classguard_integrations::{AgentCommand, BypassDecision, FixtureBackend, StaticIdentity};
use classguard_storage::Database;

const STUDENT: &str = "ada.lovelace@school.test";

struct Harness {
    agent: Agent,
    host: Arc<InMemoryHost>,
    backend: Arc<FixtureBackend>,
}

fn config(student: Option<&str>) -> AgentConfig {
    AgentConfig {
        identity: IdentityConfig {
            student_id: student.map(str::to_string),
            required_domain: Some("school.test".to_string()),
        },
        ..AgentConfig::default()
    }
}

fn harness_with(policy: &str, urls: &[&str], config: AgentConfig) -> Harness {
    let host = Arc::new(InMemoryHost::with_urls(urls));
    let backend = Arc::new(FixtureBackend::new(serde_json::from_str(policy).unwrap()));
    let agent = Agent::new(AgentParts {
        config,
        backend: backend.clone(),
        host: host.clone(),
        rule_engine: host.clone(),
        identity: Arc::new(StaticIdentity::new(None)),
        state: StateActor::spawn(Database::in_memory().unwrap()),
    });
    Harness {
        agent,
        host,
        backend,
    }
}

async fn harness(policy: &str, urls: &[&str]) -> Harness {
    let h = harness_with(policy, urls, config(Some("Ada.Lovelace@School.test")));
    h.agent.bootstrap(Utc::now()).await.unwrap();
    h
}

#[tokio::test]
async fn test_bootstrap_normalizes_identity() {
    let h = harness("{}", &[]).await;
    let student = h.agent.state().read(|s| s.student.clone()).await.unwrap();
    assert_eq!(
        student,
        Some(StudentRecord {
            id: STUDENT.to_string(),
            display_name: "ada lovelace".to_string(),
        })
    );
}

#[tokio::test]
async fn test_foreign_account_enters_safe_mode_once() {
    let h = harness_with(
        r#"{"paused": true}"#,
        &["https://a.test/"],
        config(Some("someone@gmail.test")),
    );
    let focus = PolicySnapshot {
        focus_mode: true,
        ..PolicySnapshot::default()
    };
    let stale = RuleCompiler::new(BlockPages::default()).compile(&focus);
    h.host.add_rules(&stale.rules).await.unwrap();

    let err = h.agent.bootstrap(Utc::now()).await.unwrap_err();
    assert!(matches!(err, AgentError::IdentityUnresolved(_)));
    assert!(h.host.rules().is_empty());
    assert_eq!(h.host.notifications().len(), 1);
    assert!(!h.agent.is_enforcing().await);

    h.agent.bootstrap(Utc::now()).await.unwrap_err();
    assert_eq!(h.host.notifications().len(), 1);

    // Loops idle: nothing is fetched
    h.agent.policy_tick(Utc::now()).await;
    assert_eq!(h.backend.policy_fetches(), 0);
    assert_eq!(h.host.urls(), vec!["https://a.test/"]);
}

#[tokio::test]
async fn test_missing_identity_uses_provider() {
    let h = harness_with("{}", &[], config(None));
    let err = h.agent.bootstrap(Utc::now()).await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::IdentityUnresolved(IdentityError::Missing)
    ));
    let status = h.agent.status(Utc::now()).await;
    assert!(status.safe_mode.is_some());
    assert_eq!(status.student, None);
}

#[tokio::test]
async fn test_sync_enforces_teacher_blocks_and_categories() {
    let policy = r#"{
        "teacher_blocks": ["*://*.games.example/*"],
        "categories": {"Social": {"urls": ["*://*.social.test/*"], "path": "social"}},
        "active_policy": {"id": 3, "name": "Grade 5"},
        "bypass_enabled": true
    }"#;
    let h = harness(
        policy,
        &[
            "https://play.games.example/a",
            "https://www.social.test/feed",
            "https://school.test/",
            "chrome://newtab",
        ],
    )
    .await;

    let outcome = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(outcome.mode, Mode::Normal);
    assert_eq!(outcome.rules_installed, 0);
    assert_eq!(outcome.pause, PauseTransition::Idle);
    assert_eq!(outcome.sweep.inspected, 3);
    assert_eq!(outcome.sweep.redirected, 2);
    assert_eq!(outcome.pushed, 3);

    let urls = h.host.urls();
    assert!(urls[0].starts_with(&BlockPages::default().teacher_block));
    assert!(urls[0].contains("url=https%3A%2F%2Fplay.games.example%2Fa"));
    assert!(urls[1].starts_with(&BlockPages::default().blocked));
    assert!(urls[1].contains("cat=Social"));
    assert!(urls[1].contains("bypass=1"));
    assert_eq!(urls[2], "https://school.test/");

    // A second sweep over the corrected sessions changes nothing
    let again = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(again.sweep.redirected, 0);
    assert_eq!(h.host.urls(), urls);
}

#[tokio::test]
async fn test_lifting_teacher_block_restores_session() {
    let h = harness(
        r#"{"teacher_blocks": ["*://*.games.example/*"]}"#,
        &["https://play.games.example/a"],
    )
    .await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();

    h.backend.set_policy(serde_json::from_str("{}").unwrap());
    let outcome = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(outcome.sweep.restored, 1);
    assert_eq!(h.host.urls(), vec!["https://play.games.example/a"]);
}

#[tokio::test]
async fn test_pause_saves_real_urls_then_resume_restores() {
    let h = harness(r#"{"paused": true}"#, &["https://a.test/", "https://b.test/"]).await;
    let now = Utc::now();

    let outcome = h.agent.sync_cycle(now).await.unwrap();
    assert_eq!(outcome.mode, Mode::Paused);
    assert_eq!(outcome.rules_installed, 1);
    assert_eq!(outcome.pause, PauseTransition::Entered { saved: 2 });
    assert_eq!(h.host.urls(), vec![BlockPages::default().locked]);

    let saved: Vec<String> = h
        .agent
        .state()
        .read(|s| {
            s.pause_saved
                .as_ref()
                .map(|set| set.sessions.iter().map(|x| x.url.clone()).collect())
                .unwrap_or_default()
        })
        .await
        .unwrap();
    assert_eq!(saved, vec!["https://a.test/", "https://b.test/"]);

    h.backend.set_policy(serde_json::from_str("{}").unwrap());
    let outcome = h
        .agent
        .sync_cycle(now + chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(outcome.pause, PauseTransition::Released { restored: 2 });
    assert!(h.host.rules().is_empty());
    assert_eq!(h.host.urls(), vec!["https://a.test/", "https://b.test/"]);
}

#[tokio::test]
async fn test_focus_mode_locks_out_other_hosts() {
    let h = harness(
        r#"{"focus_mode": true, "allowlist": ["*://*.docs.example/*"]}"#,
        &["https://docs.example/file", "https://anything-else.test/"],
    )
    .await;

    let outcome = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(outcome.mode, Mode::Focus);
    assert_eq!(
        h.host.urls(),
        vec![
            "https://docs.example/file".to_string(),
            BlockPages::default().zero_trust
        ]
    );
}

#[tokio::test]
async fn test_closed_exam_session_is_reopened() {
    let exam = "https://quiz.exams.test/start";
    let h = harness("{}", &["https://a.test/"]).await;
    h.backend.push_commands(vec![AgentCommand::ExamStart {
        url: exam.to_string(),
    }]);
    h.agent.command_cycle(Utc::now()).await.unwrap();
    assert_eq!(h.host.urls(), vec![exam.to_string()]);

    let ids: Vec<SessionId> = h.host.sessions().iter().map(|s| s.id).collect();
    h.host.remove_sessions(&ids).await.unwrap();

    let outcome = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert!(outcome.exam_reopened);
    assert_eq!(outcome.mode, Mode::Exam { url: exam.to_string() });
    assert_eq!(h.host.urls(), vec![exam.to_string()]);
    let reopened = h.host.sessions()[0].id;
    assert!(h
        .host
        .messages()
        .contains(&(reopened, PageMessage::ExamOverlayOn)));

    // Exam still open: nothing more to do
    let again = h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert!(!again.exam_reopened);
    assert_eq!(h.host.urls(), vec![exam.to_string()]);
}

#[tokio::test]
async fn test_safe_mode_makes_no_backend_calls() {
    let h = harness_with(
        r#"{"focus_mode": true}"#,
        &["https://a.test/"],
        config(Some("someone@gmail.test")),
    );
    h.backend.push_commands(vec![AgentCommand::PolicyRefresh]);
    h.agent.bootstrap(Utc::now()).await.unwrap_err();

    h.agent.policy_tick(Utc::now()).await;
    h.agent.heartbeat_cycle(Utc::now()).await.unwrap();
    assert!(h.agent.sync_cycle(Utc::now()).await.is_err());
    assert!(h.agent.command_cycle(Utc::now()).await.is_err());

    assert_eq!(h.backend.policy_fetches(), 0);
    assert!(h.backend.heartbeats().is_empty());
    assert!(h.host.rules().is_empty());
}

#[tokio::test]
async fn test_class_activation_notifies_once() {
    let h = harness(r#"{"class": {"id": "c1", "name": "Math", "active": true}}"#, &[]).await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();
    h.agent.sync_cycle(Utc::now()).await.unwrap();

    let notes = h.host.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].title, "Class session is active");
    assert_eq!(notes[0].message, "Math");
}

#[tokio::test]
async fn test_announcement_and_push_delivered() {
    let h = harness(
        r#"{"announcement": "Quiz at 10", "scenes": {"theme": "space"}}"#,
        &["https://a.test/"],
    )
    .await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();
    h.agent.sync_cycle(Utc::now()).await.unwrap();

    let messages = h.host.messages();
    let announcements = messages
        .iter()
        .filter(|(_, m)| matches!(m, PageMessage::Announcement { .. }))
        .count();
    assert_eq!(announcements, 1);
    let pushes: Vec<&PageMessage> = messages
        .iter()
        .map(|(_, m)| m)
        .filter(|m| matches!(m, PageMessage::PolicyPush { .. }))
        .collect();
    assert_eq!(pushes.len(), 2);
    if let PageMessage::PolicyPush { policy, scenes } = pushes[0] {
        assert_eq!(policy["announcement"], "Quiz at 10");
        assert_eq!(scenes.as_ref().unwrap()["theme"], "space");
    }
}

#[tokio::test]
async fn test_pending_actions_run_during_sync() {
    let h = harness(
        r#"{"pending": [{"type": "open_tabs", "urls": ["https://lesson.test/"]}, {"type": "mystery"}]}"#,
        &["https://a.test/"],
    )
    .await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(h.host.urls(), vec!["https://a.test/", "https://lesson.test/"]);
}

#[tokio::test]
async fn test_offline_backend_skips_cycle() {
    let h = harness(r#"{"paused": true}"#, &["https://a.test/"]).await;
    h.backend.set_offline(true);

    let err = h.agent.sync_cycle(Utc::now()).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.host.urls(), vec!["https://a.test/"]);
    assert_eq!(h.agent.state().read(AgentState::mode).await.unwrap(), Mode::Normal);
}

#[tokio::test]
async fn test_policy_refresh_command_resyncs() {
    let h = harness("{}", &[]).await;
    h.backend.push_commands(vec![AgentCommand::PolicyRefresh]);

    h.agent.policy_tick(Utc::now()).await;
    assert_eq!(h.backend.policy_fetches(), 2);
}

#[tokio::test]
async fn test_heartbeat_disable_and_enable() {
    let h = harness(r#"{"focus_mode": true}"#, &["https://a.test/"]).await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert_eq!(h.host.rules().len(), 1);

    h.backend.set_extension_enabled(Some(false));
    h.agent.heartbeat_cycle(Utc::now()).await.unwrap();
    h.agent.heartbeat_cycle(Utc::now()).await.unwrap();
    assert!(h.host.rules().is_empty());
    assert_eq!(h.host.notifications().len(), 1);
    assert_eq!(h.agent.status(Utc::now()).await.mode, "normal");
    assert!(!h.agent.status(Utc::now()).await.enabled);

    let fetches = h.backend.policy_fetches();
    h.agent.policy_tick(Utc::now()).await;
    assert_eq!(h.backend.policy_fetches(), fetches);

    h.backend.set_extension_enabled(Some(true));
    h.agent.heartbeat_cycle(Utc::now()).await.unwrap();
    assert!(h.agent.is_enforcing().await);
    h.agent.policy_tick(Utc::now()).await;
    assert_eq!(h.host.rules().len(), 1);
}

#[tokio::test]
async fn test_heartbeat_sends_offtask_check() {
    let h = harness("{}", &["https://a.test/page"]).await;
    h.agent.heartbeat_cycle(Utc::now()).await.unwrap();

    for _ in 0..50 {
        if !h.backend.offtask_checks().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let checks = h.backend.offtask_checks();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].student, STUDENT);
    assert_eq!(checks[0].url, "https://a.test/page");
    assert_eq!(h.backend.heartbeats()[0].student, STUDENT);
}

#[tokio::test]
async fn test_bypass_grant_reloads_and_survives_sweep() {
    let h = harness(
        r#"{"teacher_blocks": ["*://*.games.example/*"]}"#,
        &["https://play.games.example/a"],
    )
    .await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();
    h.backend.set_bypass_decision(BypassDecision {
        ok: true,
        allow: true,
    });

    let now = Utc::now();
    h.agent
        .handle_event(
            HostEvent::BypassAttempt {
                session_id: Some(1),
                code: "1234".to_string(),
                url: "https://play.games.example/a".to_string(),
            },
            now,
        )
        .await;

    assert_eq!(h.host.urls(), vec!["https://play.games.example/a"]);
    let requests = h.backend.bypass_requests();
    assert_eq!(requests[0].user, STUDENT);
    assert_eq!(requests[0].code, "1234");

    let outcome = h.agent.sync_cycle(now).await.unwrap();
    assert_eq!(outcome.sweep.redirected, 0);
}

#[tokio::test]
async fn test_bypass_denied_or_incomplete() {
    let h = harness("{}", &["https://a.test/"]).await;
    h.backend.set_bypass_decision(BypassDecision {
        ok: true,
        allow: false,
    });
    h.agent
        .handle_event(
            HostEvent::BypassAttempt {
                session_id: Some(1),
                code: "9".to_string(),
                url: "https://x.test/".to_string(),
            },
            Utc::now(),
        )
        .await;
    h.agent
        .handle_event(
            HostEvent::BypassAttempt {
                session_id: Some(1),
                code: " ".to_string(),
                url: "https://x.test/".to_string(),
            },
            Utc::now(),
        )
        .await;

    assert_eq!(h.backend.bypass_requests().len(), 1);
    assert_eq!(h.agent.status(Utc::now()).await.bypass_grants, 0);
    assert_eq!(h.host.urls(), vec!["https://a.test/"]);
}

#[tokio::test]
async fn test_poll_answer_and_dismissal_events() {
    let h = harness(r#"{"announcement": "Lunch"}"#, &["https://a.test/"]).await;
    h.agent
        .handle_event(
            HostEvent::PollAnswer {
                poll_id: serde_json::json!("p1"),
                answer: serde_json::json!("yes"),
            },
            Utc::now(),
        )
        .await;
    h.agent
        .handle_event(
            HostEvent::AnnouncementDismissed {
                message: "Lunch".to_string(),
            },
            Utc::now(),
        )
        .await;

    let answers = h.backend.poll_responses();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].student, STUDENT);
    assert_eq!(answers[0].poll_id, serde_json::json!("p1"));

    h.agent.sync_cycle(Utc::now()).await.unwrap();
    assert!(!h
        .host
        .messages()
        .iter()
        .any(|(_, m)| matches!(m, PageMessage::Announcement { .. })));
}

#[tokio::test]
async fn test_navigation_event_sweeps() {
    let h = harness(r#"{"teacher_blocks": ["*://*.games.example/*"]}"#, &[]).await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();

    let id = h.host.open("https://play.games.example/b", true);
    h.agent
        .handle_event(
            HostEvent::NavigationCompleted {
                session_id: id,
                url: "https://play.games.example/b".to_string(),
            },
            Utc::now(),
        )
        .await;
    assert!(h.host.urls()[0].starts_with(&BlockPages::default().teacher_block));
}

#[tokio::test]
async fn test_ipc_requests() {
    let h = harness(r#"{"focus_mode": true}"#, &[]).await;
    h.agent.sync_cycle(Utc::now()).await.unwrap();

    match h.agent.handle_request(IpcRequest::Status).await {
        IpcResponse::Status(status) => {
            assert!(status.running);
            assert_eq!(status.student.as_deref(), Some(STUDENT));
            assert_eq!(status.mode, "focus");
            assert_eq!(status.rule_count, 1);
            assert!(status.last_sync.is_some());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(
        h.agent.handle_request(IpcRequest::RefreshIdentity).await,
        IpcResponse::Identity {
            ok: true,
            student: Some(STUDENT.to_string())
        }
    );
    assert_eq!(
        h.agent.handle_request(IpcRequest::Shutdown).await,
        IpcResponse::Shutdown
    );
    assert!(h.agent.is_shutting_down());
}

#[tokio::test]
async fn test_run_stops_when_host_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let sock = socket_path(dir.path());
    let h = harness_with("{}", &[], config(Some(STUDENT)));
    let agent = Arc::new(h.agent);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    drop(events_tx);

    tokio::time::timeout(Duration::from_secs(5), agent.clone().run(events_rx, &sock))
        .await
        .unwrap()
        .unwrap();
    assert!(agent.is_shutting_down());
    assert!(!sock.exists());
}
