//! Configuration system for Lodestar.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/lodestar/config.toml` and/or `.lodestar/config.toml`
//! in the working directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for the Lodestar server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LodestarConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Which research engine adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Remote research service over HTTP.
    Http,
    /// Canned offline answers.
    Stub,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Http => write!(f, "http"),
            EngineKind::Stub => write!(f, "stub"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_kind")]
    pub kind: EngineKind,
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    /// Environment variable holding the engine credential.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Http
}
fn default_engine_url() -> String {
    "http://localhost:8001".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_engine_timeout() -> u64 {
    900
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            base_url: default_engine_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_engine_timeout(),
        }
    }
}

impl EngineConfig {
    /// Resolve the engine credential. Only the HTTP engine needs one.
    pub fn credential(&self) -> Result<Option<String>, ConfigError> {
        if self.kind == EngineKind::Stub {
            return Ok(None);
        }
        match std::env::var(&self.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => Err(ConfigError::MissingCredential {
                env_var: self.api_key_env.clone(),
            }),
        }
    }
}

/// The channel the MCP server is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over stdin/stdout.
    Stdio,
    /// `GET /sse` event stream plus `POST /messages/`.
    Sse,
    /// Single `POST /mcp` endpoint answering with JSON or an event stream.
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::StreamableHttp => write!(f, "streamable-http"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "streamable-http" | "streamable_http" | "http" => Ok(TransportKind::StreamableHttp),
            other => Err(ConfigError::Invalid {
                field: "transport.kind".into(),
                message: format!(
                    "unsupported transport '{other}' (expected stdio, sse or streamable-http)"
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `None` means "not chosen": stdio, or SSE inside a container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: None,
            host: default_host(),
            port: default_port(),
        }
    }
}

impl TransportConfig {
    /// The transport to bind, auto-selecting SSE inside a container when
    /// nothing was configured explicitly.
    pub fn resolve(&self) -> TransportKind {
        self.kind.unwrap_or_else(|| {
            if running_in_container() {
                TransportKind::Sse
            } else {
                TransportKind::Stdio
            }
        })
    }
}

fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists() || std::env::var_os("DOCKER_CONTAINER").is_some()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Finished units idle longer than this are dropped. Unset keeps them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

fn default_max_sessions() -> usize {
    crate::registry::DEFAULT_MAX_SESSIONS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

fn default_max_topics() -> usize {
    crate::cache::DEFAULT_MAX_TOPICS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            ttl_secs: None,
        }
    }
}

/// Convert an optional TTL in seconds into a chrono duration.
///
/// `field` names the setting in the error when the value is beyond what a
/// duration can represent.
pub fn ttl_from_secs(
    field: &str,
    secs: Option<u64>,
) -> Result<Option<chrono::Duration>, ConfigError> {
    let Some(secs) = secs else {
        return Ok(None);
    };
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .map(Some)
        .ok_or_else(|| ConfigError::Invalid {
            field: field.to_string(),
            message: format!("{secs} seconds is out of range"),
        })
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `LODESTAR_`)
/// 3. Workspace-local config (`.lodestar/config.toml`)
/// 4. User config (`~/.config/lodestar/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&Figment>,
) -> Result<LodestarConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(LodestarConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "lodestar", "lodestar") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".lodestar").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (LODESTAR_TRANSPORT__KIND, LODESTAR_ENGINE__BASE_URL, etc.)
    figment = figment.merge(Env::prefixed("LODESTAR_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(overrides.clone());
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

/// Render the effective configuration as TOML.
pub fn to_toml(config: &LodestarConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::Invalid {
        field: "config".into(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LodestarConfig::default();
        assert_eq!(config.engine.kind, EngineKind::Http);
        assert_eq!(config.engine.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.transport.port, 8000);
        assert!(config.transport.kind.is_none());
        assert_eq!(config.registry.max_sessions, 1024);
        assert_eq!(config.cache.max_topics, 256);
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("SSE".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert_eq!(
            "streamable-http".parse::<TransportKind>().unwrap(),
            TransportKind::StreamableHttp
        );
        let err = "carrier-pigeon".parse::<TransportKind>().unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_explicit_transport_wins() {
        let transport = TransportConfig {
            kind: Some(TransportKind::StreamableHttp),
            ..TransportConfig::default()
        };
        assert_eq!(transport.resolve(), TransportKind::StreamableHttp);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = LodestarConfig::default();
        config.transport.kind = Some(TransportKind::Sse);
        config.cache.ttl_secs = Some(60);
        let toml_str = to_toml(&config).unwrap();
        assert!(toml_str.contains("kind = \"sse\""));
        let back: LodestarConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.transport.kind, Some(TransportKind::Sse));
        assert_eq!(back.cache.ttl_secs, Some(60));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let lodestar_dir = dir.path().join(".lodestar");
        std::fs::create_dir_all(&lodestar_dir).unwrap();
        std::fs::write(
            lodestar_dir.join("config.toml"),
            r#"
[engine]
kind = "stub"

[transport]
kind = "streamable-http"
port = 9100

[cache]
max_topics = 8
ttl_secs = 3600
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.engine.kind, EngineKind::Stub);
        assert_eq!(config.transport.kind, Some(TransportKind::StreamableHttp));
        assert_eq!(config.transport.port, 9100);
        assert_eq!(config.cache.max_topics, 8);
        assert_eq!(config.cache.ttl_secs, Some(3600));
        assert_eq!(config.registry.max_sessions, 1024);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let overrides = Figment::from(Serialized::defaults(serde_json::json!({
            "transport": { "port": 9999 },
            "engine": { "kind": "stub" },
        })));
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.transport.port, 9999);
        assert_eq!(config.engine.kind, EngineKind::Stub);
    }

    #[test]
    fn test_stub_engine_needs_no_credential() {
        let config = EngineConfig {
            kind: EngineKind::Stub,
            api_key_env: "LODESTAR_TEST_UNSET_KEY_7F3A".into(),
            ..EngineConfig::default()
        };
        assert!(config.credential().unwrap().is_none());
    }

    #[test]
    fn test_http_engine_missing_credential() {
        let config = EngineConfig {
            api_key_env: "LODESTAR_TEST_UNSET_KEY_7F3A".into(),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.credential().unwrap_err(),
            ConfigError::MissingCredential { .. }
        ));
    }

    #[test]
    fn test_ttl_from_secs() {
        assert!(ttl_from_secs("cache.ttl_secs", None).unwrap().is_none());
        assert_eq!(
            ttl_from_secs("cache.ttl_secs", Some(90)).unwrap(),
            Some(chrono::Duration::seconds(90))
        );
    }

    #[test]
    fn test_ttl_beyond_duration_range_is_invalid() {
        for secs in [10_000_000_000_000_000, u64::MAX] {
            match ttl_from_secs("registry.ttl_secs", Some(secs)).unwrap_err() {
                ConfigError::Invalid { field, message } => {
                    assert_eq!(field, "registry.ttl_secs");
                    assert!(message.contains("out of range"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
