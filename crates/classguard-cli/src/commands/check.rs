//! Offline dry run of one sync cycle.
//!
//! The policy comes from a file, the browser is the in-memory host and the
//! state store lives in memory, so nothing on disk or in a real browser is
//! touched.

use anyhow::{Context, Result};
use std::{fs, path::Path, sync::Arc};
use tabled::{Table, Tabled};

use chrono::Utc;
use classguard_core::{
    config::IdentityConfig,
    daemon::SyncOutcome,
    host::{memory::InMemoryHost, Notification, Session, SessionId},
    rules::CompiledRule,
    state::StateActor,
    Agent, AgentConfig, AgentParts, BlockPages,
};
use classguard_integrations::{FixtureBackend, PolicyDocument, StaticIdentity};
use classguard_storage::Database;

use super::{helpers::truncate_str, rules::print_rules};

pub const DEFAULT_STUDENT: &str = "student@classguard.example";

pub struct DryRun {
    pub outcome: SyncOutcome,
    pub sessions: Vec<Session>,
    pub rules: Vec<CompiledRule>,
    pub notifications: Vec<Notification>,
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "Tab")]
    id: SessionId,
    #[tabled(rename = "Before")]
    before: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Run bootstrap plus one sync cycle of `doc` over sessions open at `urls`.
///
/// # Errors
///
/// Returns an error if the in-memory store cannot be created, the student is
/// rejected or the cycle fails.
pub async fn dry_run(
    doc: PolicyDocument,
    urls: &[String],
    student: &str,
    pages: BlockPages,
) -> Result<DryRun> {
    let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
    let host = Arc::new(InMemoryHost::with_urls(&urls));
    let agent = Agent::new(AgentParts {
        config: AgentConfig {
            identity: IdentityConfig {
                student_id: Some(student.to_string()),
                required_domain: None,
            },
            pages,
            ..AgentConfig::default()
        },
        backend: Arc::new(FixtureBackend::new(doc)),
        host: host.clone(),
        rule_engine: host.clone(),
        identity: Arc::new(StaticIdentity::new(None)),
        state: StateActor::spawn(Database::in_memory()?),
    });

    agent
        .bootstrap(Utc::now())
        .await
        .context("Student identity rejected")?;
    let outcome = agent
        .sync_cycle(Utc::now())
        .await
        .context("Sync cycle failed")?;

    Ok(DryRun {
        outcome,
        sessions: host.sessions(),
        rules: host.rules(),
        notifications: host.notifications(),
    })
}

fn session_rows(before: &[String], after: &[Session]) -> Vec<SessionRow> {
    after
        .iter()
        .enumerate()
        .map(|(i, session)| SessionRow {
            id: session.id,
            before: before
                .get(i)
                .map_or_else(|| "(new)".to_string(), |url| truncate_str(url, 50)),
            after: truncate_str(&session.url, 50),
        })
        .collect()
}

/// `classguard check`: print what one cycle of `policy_path` would do.
///
/// # Errors
///
/// Returns an error if the policy file cannot be read or parsed, or the dry
/// run fails.
pub async fn check_command(policy_path: &Path, urls: &[String], student: &str) -> Result<()> {
    let raw = fs::read_to_string(policy_path)
        .with_context(|| format!("Failed to read {}", policy_path.display()))?;
    let doc: PolicyDocument = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse policy {}", policy_path.display()))?;
    let pages = AgentConfig::load_default()?.pages;

    let run = dry_run(doc, urls, student, pages).await?;
    let sweep = run.outcome.sweep;

    println!("Mode: {}", run.outcome.mode);
    println!("Pause: {:?}", run.outcome.pause);
    println!(
        "Sweep: {} inspected, {} redirected, {} restored, {} failed",
        sweep.inspected, sweep.redirected, sweep.restored, sweep.failed
    );
    println!();

    if run.sessions.is_empty() {
        println!("No sessions open.");
    } else {
        println!("{}", Table::new(session_rows(urls, &run.sessions)));
    }
    println!();
    print_rules(&run.rules);

    for note in &run.notifications {
        println!("\nNotification: {} - {}", note.title, note.message);
    }
    Ok(())
}
