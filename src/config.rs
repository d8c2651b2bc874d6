//! Configuration management for the session core

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub user_agent: String,
    pub local_address: String,
    pub max_sessions: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
            local_address: "127.0.0.1".to_string(),
            max_sessions: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub uri: String,
    pub display_name: Option<String>,
    pub auth_username: Option<String>,
    pub password: Option<String>,
}

impl AccountConfig {
    pub fn new<S: Into<String>>(uri: S) -> Self {
        Self {
            uri: uri.into(),
            display_name: None,
            auth_username: None,
            password: None,
        }
    }

    /// The user@host portion of the account URI, without scheme or parameters.
    pub fn address(&self) -> &str {
        let uri = self.uri.as_str();
        let uri = uri.strip_prefix("sip:").or_else(|| uri.strip_prefix("sips:")).unwrap_or(uri);
        uri.split(';').next().unwrap_or(uri)
    }

    /// Matches a request URI against this account, ignoring scheme and URI parameters.
    pub fn matches_uri(&self, request_uri: &str) -> bool {
        let requested = request_uri
            .strip_prefix("sip:")
            .or_else(|| request_uri.strip_prefix("sips:"))
            .unwrap_or(request_uri);
        let requested = requested.split(';').next().unwrap_or(requested);
        requested.eq_ignore_ascii_case(self.address())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub rtp_port_range: PortRange,
    pub msrp_port_range: PortRange,
    pub audio_codecs: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtp_port_range: PortRange { min: 50000, max: 50500 },
            msrp_port_range: PortRange { min: 2855, max: 2955 },
            audio_codecs: vec![
                "PCMU".to_string(),
                "PCMA".to_string(),
                "telephone-event".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the per-session dialog event queue.
    pub channel_capacity: usize,
    /// Seconds to wait for the dialog to report `disconnected` after a
    /// reject, local end or failure before giving up on the notification.
    pub disconnect_wait_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            disconnect_wait_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    Full,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            accounts: Vec::new(),
            media: MediaConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.max_sessions == 0 {
            return Err(Error::config("max_sessions must be greater than zero"));
        }
        if self.session.channel_capacity == 0 {
            return Err(Error::config("channel_capacity must be greater than zero"));
        }
        for range in [&self.media.rtp_port_range, &self.media.msrp_port_range] {
            if range.min == 0 || range.min > range.max {
                return Err(Error::config(format!(
                    "invalid port range {}-{}",
                    range.min, range.max
                )));
            }
        }
        if self.media.audio_codecs.is_empty() {
            return Err(Error::config("at least one audio codec must be configured"));
        }
        for account in &self.accounts {
            if !account.uri.starts_with("sip:") && !account.uri.starts_with("sips:") {
                return Err(Error::config(format!("invalid account URI: {}", account.uri)));
            }
            if !account.address().contains('@') {
                return Err(Error::config(format!("account URI has no user part: {}", account.uri)));
            }
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::config(format!("invalid log level: {}", other))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = CoreConfig::default();
        config.media.rtp_port_range = PortRange { min: 6000, max: 5000 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_account_uri_matching() {
        let account = AccountConfig::new("sip:alice@example.com");
        assert!(account.matches_uri("sip:alice@example.com"));
        assert!(account.matches_uri("sip:Alice@Example.Com;transport=tcp"));
        assert!(account.matches_uri("alice@example.com"));
        assert!(!account.matches_uri("sip:bob@example.com"));
    }

    #[test]
    fn test_account_uri_validation() {
        let mut config = CoreConfig::default();
        config.accounts.push(AccountConfig::new("alice@example.com"));
        assert!(config.validate().is_err());
        config.accounts.clear();
        config.accounts.push(AccountConfig::new("sip:example.com"));
        assert!(config.validate().is_err());
        config.accounts.clear();
        config.accounts.push(AccountConfig::new("sip:alice@example.com"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessioncore.toml");
        std::fs::write(
            &path,
            "[general]\nuser_agent = \"file-agent/1.0\"\nlocal_address = \"192.0.2.7\"\nmax_sessions = 4\n",
        )
        .unwrap();
        let config = assert_ok!(CoreConfig::from_file(&path));
        assert_eq!(config.general.user_agent, "file-agent/1.0");
        assert_eq!(config.general.max_sessions, 4);
        assert!(CoreConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let raw = r#"
            [general]
            user_agent = "test-agent/1.0"
            local_address = "192.0.2.10"
            max_sessions = 8

            [[accounts]]
            uri = "sip:alice@example.com"
            display_name = "Alice"

            [session]
            channel_capacity = 16
            disconnect_wait_secs = 2
        "#;
        let config: CoreConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.general.local_address, "192.0.2.10");
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.session.channel_capacity, 16);
        assert!(config.validate().is_ok());
    }
}
