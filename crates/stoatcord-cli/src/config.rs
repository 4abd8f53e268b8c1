use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stoatcord_channels::discord::DEFAULT_WEBHOOK_NAME;
use stoatcord_channels::stoat_api::{
    DEFAULT_API_URL, DEFAULT_FILES_URL, DEFAULT_WS_URL, StoatEndpoints,
};
use stoatcord_core::{BridgeError, PairTable, RelayLimits};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub discord: DiscordConfig,
    pub stoat: StoatConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    pub channel_ids: Vec<String>,
    #[serde(default = "default_webhook_name")]
    pub webhook_name: String,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("token", &mask_secret(&self.token))
            .field("channel_ids", &self.channel_ids)
            .field("webhook_name", &self.webhook_name)
            .finish()
    }
}

fn default_webhook_name() -> String {
    DEFAULT_WEBHOOK_NAME.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoatConfig {
    pub token: String,
    pub channel_ids: Vec<String>,
    #[serde(default = "default_stoat_api_url")]
    pub api_url: String,
    #[serde(default = "default_stoat_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_stoat_files_url")]
    pub files_url: String,
}

impl std::fmt::Debug for StoatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoatConfig")
            .field("token", &mask_secret(&self.token))
            .field("channel_ids", &self.channel_ids)
            .field("api_url", &self.api_url)
            .field("ws_url", &self.ws_url)
            .field("files_url", &self.files_url)
            .finish()
    }
}

fn default_stoat_api_url() -> String {
    DEFAULT_API_URL.to_string()
}
fn default_stoat_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}
fn default_stoat_files_url() -> String {
    DEFAULT_FILES_URL.to_string()
}

impl StoatConfig {
    pub fn endpoints(&self) -> StoatEndpoints {
        StoatEndpoints {
            api_url: self.api_url.clone(),
            ws_url: self.ws_url.clone(),
            files_url: self.files_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Inbound events queued per platform before the client is slowed down
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// How long shutdown waits for in-flight sends
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_discord_to_stoat")]
    pub discord_to_stoat: LimitsConfig,
    #[serde(default = "default_stoat_to_discord")]
    pub stoat_to_discord: LimitsConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_content_chars: usize,
    pub max_name_chars: usize,
}

impl From<LimitsConfig> for RelayLimits {
    fn from(limits: LimitsConfig) -> Self {
        Self {
            max_content_chars: limits.max_content_chars,
            max_name_chars: limits.max_name_chars,
        }
    }
}

fn default_buffer_size() -> usize {
    256
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_discord_to_stoat() -> LimitsConfig {
    LimitsConfig {
        max_content_chars: RelayLimits::STOAT.max_content_chars,
        max_name_chars: RelayLimits::STOAT.max_name_chars,
    }
}
fn default_stoat_to_discord() -> LimitsConfig {
    LimitsConfig {
        max_content_chars: RelayLimits::DISCORD.max_content_chars,
        max_name_chars: RelayLimits::DISCORD.max_name_chars,
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            discord_to_stoat: default_discord_to_stoat(),
            stoat_to_discord: default_stoat_to_discord(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

/// Split a comma-separated id list, dropping empty entries
fn parse_id_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl BridgeConfig {
    /// Load from `custom_path` if given, otherwise from the environment
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        match custom_path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(|name| std::env::var(name).ok()),
        }
    }

    /// Build from environment-style variables looked up through `lookup`
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).unwrap_or_default();
        let get_or = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let mut config = Self {
            discord: DiscordConfig {
                token: get("DISCORD_BOT_TOKEN").trim().to_string(),
                channel_ids: parse_id_list(&get("DISCORD_CHANNEL_IDS")),
                webhook_name: get_or("DISCORD_WEBHOOK_NAME", DEFAULT_WEBHOOK_NAME),
            },
            stoat: StoatConfig {
                token: get("STOAT_BOT_TOKEN").trim().to_string(),
                channel_ids: parse_id_list(&get("STOAT_CHANNEL_IDS")),
                api_url: get_or("STOAT_API_URL", DEFAULT_API_URL),
                ws_url: get_or("STOAT_WS_URL", DEFAULT_WS_URL),
                files_url: get_or("STOAT_FILES_URL", DEFAULT_FILES_URL),
            },
            relay: RelayConfig::default(),
        };
        config.canonicalize_discord_ids();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        // Refuse a config file others can read: it holds bot tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::from_toml(&content, |name| std::env::var(name).ok())
            .with_context(|| format!("Invalid config at {}", path.display()))
    }

    /// Parse TOML after expanding allow-listed `${VAR}` references
    pub fn from_toml<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expanded = expand_env_vars(content, lookup);
        let mut config: Self = toml::from_str(&expanded).context("Failed to parse config")?;
        config.canonicalize_discord_ids();

        if !config.discord.token.is_empty() && !content.contains("${DISCORD_BOT_TOKEN}") {
            warn!(
                "Discord token is hardcoded in config file. For security, use environment variables: token = \"${{DISCORD_BOT_TOKEN}}\""
            );
        }
        if !config.stoat.token.is_empty() && !content.contains("${STOAT_BOT_TOKEN}") {
            warn!(
                "Stoat token is hardcoded in config file. For security, use environment variables: token = \"${{STOAT_BOT_TOKEN}}\""
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Rewrite Discord ids the way the gateway prints them ("+0042" -> "42"),
    /// so pair lookups match the channel ids on incoming events.
    /// Ids that are not numbers are left for `validate` to reject.
    fn canonicalize_discord_ids(&mut self) {
        for id in &mut self.discord.channel_ids {
            if let Ok(n) = id.parse::<u64>() {
                *id = n.to_string();
            }
        }
    }

    /// Check everything that must hold before any client connects
    pub fn validate(&self) -> stoatcord_core::error::Result<()> {
        if self.discord.token.is_empty() {
            return Err(BridgeError::configuration("DISCORD_BOT_TOKEN is missing"));
        }
        if self.stoat.token.is_empty() {
            return Err(BridgeError::configuration("STOAT_BOT_TOKEN is missing"));
        }
        if self.discord.channel_ids.is_empty() {
            return Err(BridgeError::configuration("DISCORD_CHANNEL_IDS is empty"));
        }
        if self.stoat.channel_ids.is_empty() {
            return Err(BridgeError::configuration("STOAT_CHANNEL_IDS is empty"));
        }
        for id in &self.discord.channel_ids {
            if !id.parse::<u64>().is_ok_and(|n| n != 0 && n.to_string() == *id) {
                return Err(BridgeError::configuration(format!(
                    "Discord channel id '{}' is not a snowflake",
                    id
                )));
            }
        }
        for (name, value) in [
            ("Stoat api_url", &self.stoat.api_url),
            ("Stoat ws_url", &self.stoat.ws_url),
            ("Stoat files_url", &self.stoat.files_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                BridgeError::configuration(format!("{} '{}' is invalid: {}", name, value, e))
            })?;
        }
        for (name, limits) in [
            ("discord_to_stoat", &self.relay.discord_to_stoat),
            ("stoat_to_discord", &self.relay.stoat_to_discord),
        ] {
            if limits.max_content_chars == 0 || limits.max_name_chars == 0 {
                return Err(BridgeError::configuration(format!(
                    "relay.{} limits must be greater than zero",
                    name
                )));
            }
        }
        if self.relay.buffer_size == 0 {
            return Err(BridgeError::configuration(
                "relay.buffer_size must be greater than zero",
            ));
        }
        self.pair_table().map(|_| ())
    }

    pub fn pair_table(&self) -> stoatcord_core::error::Result<PairTable> {
        PairTable::new(&self.discord.channel_ids, &self.stoat.channel_ids)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "DISCORD_BOT_TOKEN",
    "STOAT_BOT_TOKEN",
    "DISCORD_CHANNEL_IDS",
    "STOAT_CHANNEL_IDS",
    "STOAT_API_URL",
    "STOAT_WS_URL",
    "STOAT_FILES_URL",
    "HOME",
    "USER",
];

fn expand_env_vars<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn valid_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DISCORD_BOT_TOKEN", "discord-token-123456"),
            ("STOAT_BOT_TOKEN", "stoat-token-123456"),
            ("DISCORD_CHANNEL_IDS", "111111111111, 222222222222,"),
            ("STOAT_CHANNEL_IDS", "01AAA,01BBB"),
        ]
    }

    #[test]
    fn test_from_env() {
        let cfg = BridgeConfig::from_env(env(&valid_env())).unwrap();
        assert_eq!(cfg.discord.channel_ids, vec!["111111111111", "222222222222"]);
        assert_eq!(cfg.stoat.channel_ids, vec!["01AAA", "01BBB"]);
        assert_eq!(cfg.stoat.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.discord.webhook_name, DEFAULT_WEBHOOK_NAME);

        let pairs = cfg.pair_table().unwrap();
        assert_eq!(pairs.resolve_to_stoat("222222222222"), Some("01BBB"));
    }

    #[test]
    fn test_from_env_overrides() {
        let mut vars = valid_env();
        vars.push(("STOAT_API_URL", "https://api.example.com"));
        vars.push(("DISCORD_WEBHOOK_NAME", "Relay"));
        let cfg = BridgeConfig::from_env(env(&vars)).unwrap();
        assert_eq!(cfg.stoat.api_url, "https://api.example.com");
        assert_eq!(cfg.stoat.endpoints().api_url, "https://api.example.com");
        assert_eq!(cfg.discord.webhook_name, "Relay");
    }

    #[test]
    fn test_missing_token_rejected() {
        let vars: Vec<_> = valid_env()
            .into_iter()
            .filter(|(k, _)| *k != "STOAT_BOT_TOKEN")
            .collect();
        let err = BridgeConfig::from_env(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("STOAT_BOT_TOKEN"));
    }

    #[test]
    fn test_empty_id_list_rejected() {
        let mut vars = valid_env();
        vars.retain(|(k, _)| *k != "DISCORD_CHANNEL_IDS");
        vars.push(("DISCORD_CHANNEL_IDS", " , ,"));
        let err = BridgeConfig::from_env(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("DISCORD_CHANNEL_IDS"));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut vars = valid_env();
        vars.retain(|(k, _)| *k != "STOAT_CHANNEL_IDS");
        vars.push(("STOAT_CHANNEL_IDS", "01AAA"));
        let err = BridgeConfig::from_env(env(&vars)).unwrap_err();
        let bridge_err = err.downcast_ref::<BridgeError>().unwrap();
        assert!(bridge_err.is_fatal());
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_non_numeric_discord_id_rejected() {
        let mut vars = valid_env();
        vars.retain(|(k, _)| *k != "DISCORD_CHANNEL_IDS");
        vars.push(("DISCORD_CHANNEL_IDS", "general,222222222222"));
        let err = BridgeConfig::from_env(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("'general'"));
    }

    #[test]
    fn test_discord_ids_canonicalized() {
        let mut vars = valid_env();
        vars.retain(|(k, _)| *k != "DISCORD_CHANNEL_IDS");
        vars.push(("DISCORD_CHANNEL_IDS", "0111111111111,+222222222222"));
        let cfg = BridgeConfig::from_env(env(&vars)).unwrap();
        assert_eq!(cfg.discord.channel_ids, vec!["111111111111", "222222222222"]);

        let pairs = cfg.pair_table().unwrap();
        assert_eq!(pairs.resolve_to_stoat("111111111111"), Some("01AAA"));
        assert_eq!(pairs.resolve_to_stoat("222222222222"), Some("01BBB"));
        assert_eq!(pairs.resolve_to_discord("01AAA"), Some("111111111111"));
    }

    #[test]
    fn test_discord_ids_equal_after_canonicalizing_rejected() {
        let mut vars = valid_env();
        vars.retain(|(k, _)| *k != "DISCORD_CHANNEL_IDS");
        vars.push(("DISCORD_CHANNEL_IDS", "111111111111,0111111111111"));
        let err = BridgeConfig::from_env(env(&vars)).unwrap_err();
        assert!(err.to_string().contains("more than one pair"));
    }

    #[test]
    fn test_non_canonical_id_fails_validation() {
        let mut cfg = BridgeConfig::from_env(env(&valid_env())).unwrap();
        cfg.discord.channel_ids[0] = "+111111111111".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut vars = valid_env();
        vars.push(("STOAT_WS_URL", "not a url"));
        assert!(BridgeConfig::from_env(env(&vars)).is_err());
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn test_from_toml_with_expansion() {
        let toml = r#"
            [discord]
            token = "${DISCORD_BOT_TOKEN}"
            channel_ids = ["111111111111"]

            [stoat]
            token = "${STOAT_BOT_TOKEN}"
            channel_ids = ["01AAA"]
            api_url = "https://api.example.com"

            [relay]
            buffer_size = 64

            [relay.discord_to_stoat]
            max_content_chars = 1000
            max_name_chars = 20
        "#;
        let cfg = BridgeConfig::from_toml(toml, env(&valid_env())).unwrap();
        assert_eq!(cfg.discord.token, "discord-token-123456");
        assert_eq!(cfg.stoat.token, "stoat-token-123456");
        assert_eq!(cfg.stoat.api_url, "https://api.example.com");
        assert_eq!(cfg.stoat.ws_url, DEFAULT_WS_URL);
        assert_eq!(cfg.relay.buffer_size, 64);
        assert_eq!(cfg.relay.discord_to_stoat.max_name_chars, 20);
        assert_eq!(cfg.relay.stoat_to_discord.max_name_chars, 80);
        assert_eq!(cfg.relay.shutdown_grace_secs, 10);
    }

    #[test]
    fn test_from_toml_zero_limit_rejected() {
        let toml = r#"
            [discord]
            token = "a"
            channel_ids = ["1"]
            [stoat]
            token = "b"
            channel_ids = ["x"]
            [relay.stoat_to_discord]
            max_content_chars = 0
            max_name_chars = 80
        "#;
        let err = BridgeConfig::from_toml(toml, env(&[])).unwrap_err();
        assert!(format!("{:#}", err).contains("stoat_to_discord"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [discord]
            token = "discord-token"
            channel_ids = ["111111111111"]
            [stoat]
            token = "stoat-token"
            channel_ids = ["01AAA"]
            "#,
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }

        let cfg = BridgeConfig::load(&Some(path)).unwrap();
        assert_eq!(cfg.pair_table().unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_file_rejects_open_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = BridgeConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("permissive"));
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        let lookup = env(&[("STOAT_BOT_TOKEN", "tok"), ("SECRET", "nope")]);
        assert_eq!(expand_env_vars("a=${STOAT_BOT_TOKEN};", &lookup), "a=tok;");
        assert_eq!(expand_env_vars("b=${SECRET}", &lookup), "b=${SECRET}");
        assert_eq!(expand_env_vars("c=${DISCORD_BOT_TOKEN}", &lookup), "c=");
        assert_eq!(expand_env_vars("unterminated ${STOAT", &lookup), "unterminated ${STOAT");
    }

    #[test]
    fn test_debug_masks_tokens() {
        let cfg = BridgeConfig::from_env(env(&valid_env())).unwrap();
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("discord-token-123456"));
        assert!(debug.contains("dis...3456"));
    }

    #[test]
    fn test_mask_secret_short() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("abc"), "***");
    }
}
