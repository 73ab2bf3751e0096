//! Configuration for the chat binary.
//!
//! Values are layered: built-in defaults, then the `chat:` section of a YAML
//! file, then `MESH_CHAT_*` environment variables. Command-line flags are
//! applied last by `main`.

use anyhow::{Context, Result};
use mesh_session::SessionConfig;
use mesh_wire::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Chat node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Display name announced to the room
    pub name: String,
    /// Host to bind and advertise
    pub host: String,
    /// Listening port
    pub port: u16,
    /// Membership cap when hosting, 0 means unlimited
    pub limit: u32,
    /// Largest accepted envelope body in bytes
    pub max_frame_size: usize,
    /// Outbound connect timeout, e.g. "5s"
    pub connect_timeout: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            port: 4400,
            limit: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: None,
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    chat: Option<FileConfig>,
}

/// `chat:` section; every key is optional
#[derive(Debug, Deserialize)]
struct FileConfig {
    name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    limit: Option<u32>,
    max_frame_size: Option<usize>,
    connect_timeout: Option<String>,
}

impl ChatConfig {
    /// Load configuration from file and environment variables
    ///
    /// A missing or unparsable file falls back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(file) = root.chat {
                        config.apply_file_config(file);
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => info!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Chat configuration: name={:?}, host={}, port={}, limit={}",
            config.name, config.host, config.port, config.limit
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) {
        if let Some(name) = file.name {
            self.name = name;
        }
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(limit) = file.limit {
            self.limit = limit;
        }
        if let Some(max_frame_size) = file.max_frame_size {
            self.max_frame_size = max_frame_size;
        }
        if file.connect_timeout.is_some() {
            self.connect_timeout = file.connect_timeout;
        }
    }

    /// Apply `MESH_CHAT_*` overrides from `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MESH_CHAT_NAME") {
            info!("Name overridden by environment: {}", name);
            self.name = name;
        }

        if let Some(host) = lookup("MESH_CHAT_HOST") {
            info!("Host overridden by environment: {}", host);
            self.host = host;
        }

        if let Some(port) = lookup("MESH_CHAT_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid MESH_CHAT_PORT {:?}", port),
            }
        }

        if let Some(limit) = lookup("MESH_CHAT_LIMIT") {
            match limit.parse::<u32>() {
                Ok(limit) => {
                    self.limit = limit;
                    info!("Limit overridden by environment: {}", limit);
                }
                Err(_) => warn!("Ignoring invalid MESH_CHAT_LIMIT {:?}", limit),
            }
        }
    }

    /// Parsed connect timeout
    pub fn connect_timeout(&self) -> Result<Option<Duration>> {
        self.connect_timeout
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw)
                    .with_context(|| format!("invalid connect_timeout {:?}", raw))
            })
            .transpose()
    }

    /// Check values that would otherwise fail later
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.max_frame_size == 0 {
            anyhow::bail!("max_frame_size must be positive");
        }
        self.connect_timeout()?;
        Ok(())
    }

    /// Session settings for this configuration
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            limit: self.limit,
            max_frame_size: self.max_frame_size,
            connect_timeout: self.connect_timeout()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ChatConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 4400);
        assert_eq!(config.limit, 0);
        assert!(config.name.is_empty());
        assert_eq!(config.connect_timeout().unwrap(), None);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
chat:
  name: alice
  port: 5500
  limit: 3
  connect_timeout: 2s
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ChatConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.name, "alice");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5500);
        assert_eq!(config.limit, 3);
        assert_eq!(
            config.connect_timeout().unwrap(),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.port, ChatConfig::default().port);
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"chat: [not, a, map").unwrap();

        let config = ChatConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.limit, 0);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_CHAT_NAME", "bob"),
            ("MESH_CHAT_PORT", "6600"),
            ("MESH_CHAT_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ChatConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.name, "bob");
        assert_eq!(config.port, 6600);
        assert_eq!(config.limit, 0);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let config = ChatConfig {
            connect_timeout: Some("soon".to_string()),
            ..ChatConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.to_session_config().is_err());
    }
}
