//! Engine configuration, loaded from TOML with per-field defaults.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Debounce window for a lone text waiting on a possible album merge.
    pub text_debounce_ms: u64,
    /// Debounce window for an attachment group collecting its parts.
    pub group_debounce_ms: u64,
    /// Minimum accepted submission text length, in characters.
    pub min_text_length: usize,
    /// Minimum delay between consecutive broadcast sends.
    pub send_interval_ms: u64,
    /// Lifetime of self-retracting acknowledgment messages.
    pub ephemeral_ttl_ms: u64,
    /// Grant publish permission to newly registered users.
    pub auto_grant_publish: bool,
    /// Restrict broadcasts to users subscribed to the task's tag.
    pub tag_filtering: bool,
    pub links: Links,
}

/// Static links used by command replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Links {
    pub rules: String,
    pub general_chat: String,
    pub support: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            text_debounce_ms: 1_500,
            group_debounce_ms: 1_000,
            min_text_length: 13,
            send_interval_ms: 300,
            ephemeral_ttl_ms: 5_000,
            auto_grant_publish: false,
            tag_filtering: false,
            links: Links::default(),
        }
    }
}

impl Default for Links {
    fn default() -> Self {
        Self {
            rules: String::new(),
            general_chat: String::new(),
            support: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config: {}", path.display()))
    }

    pub fn text_debounce(&self) -> Duration {
        Duration::from_millis(self.text_debounce_ms)
    }

    pub fn group_debounce(&self) -> Duration {
        Duration::from_millis(self.group_debounce_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_millis(self.ephemeral_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "min_text_length = 20\n[links]\nsupport = \"https://t.me/ops\"")
            .expect("write");

        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.min_text_length, 20);
        assert_eq!(config.links.support, "https://t.me/ops");
        assert_eq!(config.text_debounce_ms, Config::default().text_debounce_ms);
        assert!(!config.tag_filtering);
    }
}
