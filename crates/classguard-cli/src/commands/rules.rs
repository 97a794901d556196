//! Show the rules the agent would install for its persisted policy.

use anyhow::Result;
use std::path::Path;
use tabled::{Table, Tabled};

use classguard_core::{
    rules::CompiledRule,
    state::{AgentState, STATE_KEY},
    AgentConfig, RuleCompiler,
};
use classguard_storage::Database;

use super::helpers::{join_or_dash, truncate_str};

const MAX_CELL_CHARS: usize = 60;

#[derive(Tabled)]
pub struct RuleRow {
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "Priority")]
    priority: u32,
    #[tabled(rename = "Filter")]
    filter: String,
    #[tabled(rename = "Allowed Domains")]
    excluded: String,
    #[tabled(rename = "Redirect")]
    redirect: String,
}

#[must_use]
pub fn rule_rows(rules: &[CompiledRule]) -> Vec<RuleRow> {
    rules
        .iter()
        .map(|rule| RuleRow {
            id: rule.id,
            priority: rule.priority,
            filter: rule.condition.url_filter.clone(),
            excluded: truncate_str(
                &join_or_dash(&rule.condition.excluded_domains),
                MAX_CELL_CHARS,
            ),
            redirect: truncate_str(&rule.redirect_target, MAX_CELL_CHARS),
        })
        .collect()
}

/// Print `rules`, or a note when there are none.
pub fn print_rules(rules: &[CompiledRule]) {
    if rules.is_empty() {
        println!("No redirect rules (normal browsing).");
    } else {
        println!("{}", Table::new(rule_rows(rules)));
    }
}

/// Compile the persisted policy and print the result.
///
/// # Errors
///
/// Returns an error if the config or the state store cannot be read.
pub fn show_rules(data_dir: &Path) -> Result<()> {
    let config = AgentConfig::load_default()?;
    let db = Database::open_in(data_dir)?;

    let Some(state) = db.get_document::<AgentState>(STATE_KEY)? else {
        println!("No policy has been synced yet.");
        return Ok(());
    };

    let set = RuleCompiler::new(config.pages).compile(&state.snapshot);
    println!("Mode: {}", set.mode);
    if let Some(synced) = state.last_sync {
        println!("Last sync: {}", synced.to_rfc3339());
    }
    println!();
    print_rules(&set.rules);
    Ok(())
}
