use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Get the local data directory for classguard.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("classguard");
    Ok(path)
}

/// Get the path of the TOML configuration file.
///
/// # Errors
///
/// Returns an error if the config directory cannot be determined.
pub fn get_config_path() -> Result<PathBuf> {
    let mut path =
        dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Failed to get config dir"))?;
    path.push("classguard");
    path.push("config.toml");
    Ok(path)
}

/// Agent configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub identity: IdentityConfig,
    pub loops: LoopConfig,
    pub pages: BlockPages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://classguard.example".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Fixed student id. When unset the host profile email is used.
    pub student_id: Option<String>,
    /// Accounts outside this domain put the agent in safe mode.
    pub required_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub policy_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            policy_interval_secs: 5,
            heartbeat_interval_secs: 8,
        }
    }
}

/// Block pages served by the always-reachable host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPages {
    /// Shown while the class is paused.
    pub locked: String,
    /// Lockout target for exam and focus mode.
    pub zero_trust: String,
    pub teacher_block: String,
    /// Default category block page when the policy names none.
    pub blocked: String,
    pub tab_closed: String,
    pub always_allow_host: String,
}

impl Default for BlockPages {
    fn default() -> Self {
        let host = "blocked.classguard.example";
        Self {
            locked: format!("https://{host}/locked"),
            zero_trust: format!("https://{host}/zerotrust"),
            teacher_block: format!("https://{host}/teacher-block"),
            blocked: format!("https://{host}/blocked"),
            tab_closed: format!("https://{host}/tab-closed"),
            always_allow_host: host.to_string(),
        }
    }
}

impl BlockPages {
    /// Whether `host` is the always-reachable host or one of its subdomains.
    #[must_use]
    pub fn is_always_allowed_host(&self, host: &str) -> bool {
        let allow = self.always_allow_host.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        !allow.is_empty()
            && (host == allow
                || host
                    .strip_suffix(allow.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    }

    /// Whether `url` points at the always-reachable host.
    #[must_use]
    pub fn is_always_allowed_url(&self, url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.is_always_allowed_host(h)))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_locked_page(&self, url: &str) -> bool {
        url.starts_with(&self.locked)
    }

    #[must_use]
    pub fn is_teacher_block_page(&self, url: &str) -> bool {
        url.starts_with(&self.teacher_block)
    }
}

impl AgentConfig {
    /// Load configuration from `path`; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load from the default config location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config path cannot be determined or the file is invalid.
    pub fn load_default() -> Result<Self> {
        Self::load(&get_config_path()?)
    }

    /// Write configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Flatten into sorted `section.key = value` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let toml::Value::Table(root) = toml::Value::try_from(self)? else {
            anyhow::bail!("Config did not serialize to a table");
        };
        let mut out = Vec::new();
        for (section, value) in root {
            if let toml::Value::Table(fields) = value {
                for (key, value) in fields {
                    out.push((format!("{section}.{key}"), display_value(&value)));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read one dotted key such as `loops.policy_interval_secs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .find_map(|(k, v)| (k == key).then_some(v)))
    }

    /// Set one dotted key, parsing `value` as the field's type.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown keys or values of the wrong type.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let (section, field) = key
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Config key must look like section.key: {key}"))?;

        let toml::Value::Table(mut root) = toml::Value::try_from(&*self)? else {
            anyhow::bail!("Config did not serialize to a table");
        };
        let fields = match root.get_mut(section) {
            Some(toml::Value::Table(fields)) => fields,
            _ => anyhow::bail!("Unknown config section: {section}"),
        };

        let parsed = match fields.get(field) {
            Some(toml::Value::Integer(_)) => toml::Value::Integer(
                value
                    .parse()
                    .with_context(|| format!("{key} expects an integer"))?,
            ),
            Some(toml::Value::Boolean(_)) => toml::Value::Boolean(
                value
                    .parse()
                    .with_context(|| format!("{key} expects true or false"))?,
            ),
            _ => toml::Value::String(value.to_string()),
        };
        fields.insert(field.to_string(), parsed);

        let updated: Self = toml::Value::Table(root)
            .try_into()
            .with_context(|| format!("Invalid value for {key}"))?;
        if updated == *self && self.get(key)?.as_deref() != Some(value) {
            anyhow::bail!("Unknown config key: {key}");
        }
        *self = updated;
        Ok(())
    }
}

fn display_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
