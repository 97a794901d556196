//! Prospective redirect rules.
//!
//! The compiled set is installed by full replace: every installed dynamic rule
//! is removed before the new set is added, so stale rules from an earlier mode
//! never linger.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::BlockPages,
    error::AgentError,
    pattern::{host_of, UrlParts},
    policy::{Mode, PolicySnapshot},
};

/// Filter matching every http and https navigation.
pub const BLANKET_URL_FILTER: &str = "|http*";
pub const RULE_PRIORITY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub url_filter: String,
    pub resource_types: Vec<ResourceType>,
    #[serde(
        default,
        rename = "excludedRequestDomains",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub excluded_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledRule {
    pub id: u32,
    pub priority: u32,
    pub condition: RuleCondition,
    pub redirect_target: String,
}

/// Rules for one effective mode. Empty in [`Mode::Normal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRuleSet {
    pub mode: Mode,
    pub rules: Vec<CompiledRule>,
}

/// Hosts reachable during an exam: the exam host and its registrable domain.
#[must_use]
pub fn exam_hosts(exam_url: &str) -> Vec<String> {
    let Some(parts) = UrlParts::parse(exam_url) else {
        return Vec::new();
    };
    let mut hosts = vec![parts.host];
    if !hosts.contains(&parts.registrable) {
        hosts.push(parts.registrable);
    }
    hosts
}

/// Hosts reachable in focus mode, one per allowlist pattern.
#[must_use]
pub fn focus_hosts(allowlist: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    for host in allowlist.iter().filter_map(|p| host_of(p)) {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts
}

/// Turns a [`PolicySnapshot`] into the rule set for its effective mode.
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    pages: BlockPages,
}

impl RuleCompiler {
    #[must_use]
    pub const fn new(pages: BlockPages) -> Self {
        Self { pages }
    }

    #[must_use]
    pub fn compile(&self, snapshot: &PolicySnapshot) -> CompiledRuleSet {
        let mode = snapshot.mode();
        let blanket = match &mode {
            Mode::Exam { url } => {
                let mut excluded = exam_hosts(url);
                self.push_always_allowed(&mut excluded);
                Some((self.pages.zero_trust.clone(), excluded))
            }
            Mode::Paused => Some((self.pages.locked.clone(), Vec::new())),
            Mode::Focus => {
                let mut excluded = focus_hosts(&snapshot.allowlist);
                self.push_always_allowed(&mut excluded);
                Some((self.pages.zero_trust.clone(), excluded))
            }
            Mode::Normal => None,
        };

        let rules = blanket
            .map(|(target, excluded)| {
                vec![CompiledRule {
                    id: 1,
                    priority: RULE_PRIORITY,
                    condition: RuleCondition {
                        url_filter: BLANKET_URL_FILTER.to_string(),
                        resource_types: vec![ResourceType::MainFrame],
                        excluded_domains: excluded,
                    },
                    redirect_target: target,
                }]
            })
            .unwrap_or_default();

        CompiledRuleSet { mode, rules }
    }

    fn push_always_allowed(&self, hosts: &mut Vec<String>) {
        let host = self.pages.always_allow_host.to_ascii_lowercase();
        if !host.is_empty() && !hosts.contains(&host) {
            hosts.push(host);
        }
    }
}

/// Where compiled rules are installed.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn installed_rule_ids(&self) -> Result<Vec<u32>, AgentError>;
    async fn remove_rules(&self, ids: &[u32]) -> Result<(), AgentError>;
    async fn add_rules(&self, rules: &[CompiledRule]) -> Result<(), AgentError>;
}

/// Replace every installed rule with `set`.
///
/// # Errors
///
/// Returns the first engine error. A failed add leaves no rules installed.
pub async fn install(engine: &dyn RuleEngine, set: &CompiledRuleSet) -> Result<(), AgentError> {
    let installed = engine.installed_rule_ids().await?;
    if !installed.is_empty() {
        engine.remove_rules(&installed).await?;
    }
    if !set.rules.is_empty() {
        engine.add_rules(&set.rules).await?;
    }
    log::debug!(
        "Installed {} rule(s) for {} mode (replaced {})",
        set.rules.len(),
        set.mode,
        installed.len()
    );
    Ok(())
}

/// Remove every installed rule.
///
/// # Errors
///
/// Returns the engine error if listing or removal fails.
pub async fn clear(engine: &dyn RuleEngine) -> Result<(), AgentError> {
    let installed = engine.installed_rule_ids().await?;
    if !installed.is_empty() {
        engine.remove_rules(&installed).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::InMemoryHost;

    fn compiler() -> RuleCompiler {
        RuleCompiler::new(BlockPages::default())
    }

    #[test]
    fn test_normal_mode_has_no_rules() {
        let set = compiler().compile(&PolicySnapshot::default());
        assert_eq!(set.mode, Mode::Normal);
        assert!(set.rules.is_empty());
    }

    #[test]
    fn test_paused_redirects_everything_to_locked_page() {
        let snap = PolicySnapshot {
            paused: true,
            focus_mode: true,
            ..PolicySnapshot::default()
        };
        let set = compiler().compile(&snap);
        assert_eq!(set.mode, Mode::Paused);
        assert_eq!(set.rules.len(), 1);
        let rule = &set.rules[0];
        assert_eq!(rule.id, 1);
        assert_eq!(rule.priority, 1);
        assert_eq!(rule.redirect_target, BlockPages::default().locked);
        assert_eq!(rule.condition.url_filter, "|http*");
        assert_eq!(rule.condition.resource_types, vec![ResourceType::MainFrame]);
        assert!(rule.condition.excluded_domains.is_empty());
    }

    #[test]
    fn test_exam_excludes_exam_host_and_always_allowed() {
        let snap = PolicySnapshot {
            paused: true,
            exam_mode: true,
            exam_url: "https://quiz.exams.test/start".to_string(),
            ..PolicySnapshot::default()
        };
        let set = compiler().compile(&snap);
        let rule = &set.rules[0];
        assert_eq!(rule.redirect_target, BlockPages::default().zero_trust);
        assert_eq!(
            rule.condition.excluded_domains,
            vec!["quiz.exams.test", "exams.test", "blocked.classguard.example"]
        );
    }

    #[test]
    fn test_focus_excludes_allowlist_hosts() {
        let snap = PolicySnapshot {
            focus_mode: true,
            allowlist: vec![
                "*://*.docs.example/*".to_string(),
                "https://docs.example/other".to_string(),
                String::new(),
            ],
            ..PolicySnapshot::default()
        };
        let set = compiler().compile(&snap);
        assert_eq!(set.mode, Mode::Focus);
        assert_eq!(
            set.rules[0].condition.excluded_domains,
            vec!["docs.example", "blocked.classguard.example"]
        );
    }

    #[test]
    fn test_rule_wire_shape() {
        let snap = PolicySnapshot {
            focus_mode: true,
            ..PolicySnapshot::default()
        };
        let set = compiler().compile(&snap);
        let json = serde_json::to_value(&set.rules[0]).unwrap();
        assert_eq!(json["condition"]["urlFilter"], "|http*");
        assert_eq!(json["condition"]["resourceTypes"][0], "main_frame");
        assert_eq!(
            json["condition"]["excludedRequestDomains"][0],
            "blocked.classguard.example"
        );
        assert_eq!(json["redirectTarget"], BlockPages::default().zero_trust);
    }

    #[tokio::test]
    async fn test_install_replaces_previous_rules() {
        let host = InMemoryHost::new();
        let paused = compiler().compile(&PolicySnapshot {
            paused: true,
            ..PolicySnapshot::default()
        });
        install(&host, &paused).await.unwrap();
        assert_eq!(host.rules(), paused.rules);

        let normal = compiler().compile(&PolicySnapshot::default());
        install(&host, &normal).await.unwrap();
        assert!(host.rules().is_empty());

        install(&host, &paused).await.unwrap();
        install(&host, &paused).await.unwrap();
        assert_eq!(host.rules().len(), 1);

        clear(&host).await.unwrap();
        assert!(host.rules().is_empty());
    }
}
