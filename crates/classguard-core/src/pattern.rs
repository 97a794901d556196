//! Glob-style URL patterns as used in policy documents.
//!
//! `*` matches any run of characters; everything else is literal. Patterns are
//! anchored to the whole URL and compared case-insensitively.

use crate::error::AgentError;
use regex::{Regex, RegexBuilder};

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    /// Compile a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::MalformedPattern`] for empty patterns or patterns
    /// that exceed the regex engine's limits.
    pub fn compile(pattern: &str) -> Result<Self, AgentError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(AgentError::MalformedPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        let body = trimmed
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| AgentError::MalformedPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            source: trimmed.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// One-off match. Malformed patterns never match.
#[must_use]
pub fn matches(url: &str, pattern: &str) -> bool {
    match UrlPattern::compile(pattern) {
        Ok(p) => p.is_match(url),
        Err(e) => {
            log::debug!("{e}");
            false
        }
    }
}

/// A list of patterns compiled once per sweep.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<UrlPattern>,
}

impl PatternSet {
    /// Compile every pattern, dropping (and logging) malformed ones.
    pub fn compile<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match UrlPattern::compile(p.as_ref()) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    log::debug!("Skipping pattern: {e}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// First pattern matching `url`.
    #[must_use]
    pub fn first_match(&self, url: &str) -> Option<&UrlPattern> {
        self.patterns.iter().find(|p| p.is_match(url))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Bare hostname named by a pattern: `*://*.example.com/*` gives `example.com`.
#[must_use]
pub fn host_of(pattern: &str) -> Option<String> {
    let mut rest = pattern.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    rest = rest.strip_prefix("*.").unwrap_or(rest);
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    let host = rest[..end].to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Host and registrable domain of an http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub host: String,
    /// Last two labels of the host, or the host itself when shorter.
    pub registrable: String,
}

impl UrlParts {
    #[must_use]
    pub fn parse(url: &str) -> Option<Self> {
        let parsed = url::Url::parse(url).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        let labels: Vec<&str> = host.split('.').collect();
        let registrable = if labels.len() > 2 {
            labels[labels.len() - 2..].join(".")
        } else {
            host.clone()
        };
        Some(Self { host, registrable })
    }

    /// Whether either the host or the registrable domain is in `hosts`.
    #[must_use]
    pub fn is_within(&self, hosts: &[String]) -> bool {
        hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&self.host) || h.eq_ignore_ascii_case(&self.registrable))
    }
}

/// Whether `url` uses the http or https scheme.
#[must_use]
pub fn is_http_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
