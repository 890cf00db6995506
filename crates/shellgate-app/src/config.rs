//! Server configuration
//!
//! Built-in defaults, overridden by a TOML file, overridden by CLI flags and
//! their `SHELLGATE_*` environment variables. Every field has a default, so
//! an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shellgate_policy::Policy;
use shellgate_session::RegistryConfig;
use shellgate_terminal::{BackendKind, BackendSettings, BackendTimeouts, DockerConfig, PtyConfig};
use shellgate_types::DEFAULT_SCROLLBACK_BYTES;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{Cli, Commands};

/// Loaded when `--config` is not given and the file exists
pub const DEFAULT_CONFIG_FILE: &str = "shellgate.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellgateConfig {
    pub server: ServerSection,
    pub backend: BackendSection,
    pub registry: RegistrySection,
    pub rate_limit: RateLimitSection,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub kind: BackendKind,
    /// Shell for the pty backend
    pub shell: String,
    pub docker_image: String,
    pub docker_shell: String,
    pub pull_missing: bool,
    pub startup_timeout_ms: u64,
    /// Bound on write, resize and interrupt calls
    pub write_timeout_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        let pty = PtyConfig::default();
        let docker = DockerConfig::default();
        let timeouts = BackendTimeouts::default();
        Self {
            kind: BackendKind::default(),
            shell: pty.default_shell,
            docker_image: docker.image,
            docker_shell: docker.default_shell,
            pull_missing: docker.pull_missing,
            startup_timeout_ms: timeouts.startup.as_millis() as u64,
            write_timeout_ms: timeouts.write.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Parent of the per-session workspace directories
    pub workspace_root: PathBuf,
    pub kill_grace_ms: u64,
    pub reconnect_grace_ms: u64,
    pub sweep_interval_ms: u64,
    pub scrollback_bytes: usize,
    pub cleanup_workspaces: bool,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspaces"),
            kill_grace_ms: 5_000,
            reconnect_grace_ms: 60_000,
            sweep_interval_ms: 30_000,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            cleanup_workspaces: false,
        }
    }
}

/// Per-client-address connection admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_connections: u32,
    pub cooldown_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_connections: 10,
            cooldown_ms: 60_000,
        }
    }
}

impl ShellgateConfig {
    /// Read a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ShellgateConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the effective configuration for a command line
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match cli.config {
            Some(ref path) => Self::load_from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Overlay flags given on the command line
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(Commands::Serve(ref args)) = cli.command {
            if let Some(ref bind) = args.bind {
                self.server.bind = bind.clone();
            }
            if let Some(port) = args.port {
                self.server.port = port;
            }
            if let Some(kind) = args.backend {
                self.backend.kind = kind;
            }
            if let Some(ref root) = args.workspace_root {
                self.registry.workspace_root = root.clone();
            }
            if let Some(ref dir) = args.static_dir {
                self.server.static_dir = Some(dir.clone());
            }
            if args.auto_approve {
                self.policy.auto_approve_mode = true;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        self.bind_addr()?;
        if self.rate_limit.max_connections == 0 {
            anyhow::bail!("rate_limit.max_connections must be at least 1");
        }
        if self.registry.sweep_interval_ms == 0 {
            anyhow::bail!("registry.sweep_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .with_context(|| {
                format!("invalid bind address {}:{}", self.server.bind, self.server.port)
            })
    }

    pub fn backend_settings(&self) -> BackendSettings {
        let backend = &self.backend;
        BackendSettings {
            kind: backend.kind,
            pty: PtyConfig {
                default_shell: backend.shell.clone(),
                ..PtyConfig::default()
            },
            docker: DockerConfig {
                image: backend.docker_image.clone(),
                default_shell: backend.docker_shell.clone(),
                pull_missing: backend.pull_missing,
                ..DockerConfig::default()
            },
            timeouts: BackendTimeouts {
                startup: Duration::from_millis(backend.startup_timeout_ms),
                write: Duration::from_millis(backend.write_timeout_ms),
            },
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        let registry = &self.registry;
        RegistryConfig {
            kill_grace: Duration::from_millis(registry.kill_grace_ms),
            reconnect_grace: Duration::from_millis(registry.reconnect_grace_ms),
            sweep_interval: Duration::from_millis(registry.sweep_interval_ms),
            scrollback_bytes: registry.scrollback_bytes,
            cleanup_workspaces: registry.cleanup_workspaces,
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_is_the_default() {
        let config: ShellgateConfig = toml::from_str("").unwrap();
        assert_eq!(config, ShellgateConfig::default());
        assert_eq!(config.rate_limit.max_connections, 10);
        assert_eq!(config.policy.max_concurrent_sessions, 5);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: ShellgateConfig = toml::from_str(
            r#"
            [server]
            port = 9100

            [registry]
            cleanup_workspaces = true

            [policy]
            autoApproveMode = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(config.registry.cleanup_workspaces);
        assert_eq!(config.registry.kill_grace_ms, 5_000);
        assert!(config.policy.auto_approve_mode);
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shellgate.toml");
        std::fs::write(&path, "[server]\nport = 9100\nbind = \"0.0.0.0\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "shellgate",
            "--config",
            path.to_str().unwrap(),
            "serve",
            "--port",
            "9200",
            "--auto-approve",
        ])
        .unwrap();
        let config = ShellgateConfig::load(&cli).unwrap();

        assert_eq!(config.server.port, 9200);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.policy.auto_approve_mode);
    }

    #[test]
    fn test_invalid_policy_is_refused() {
        let mut config = ShellgateConfig::default();
        config.policy.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let config = ShellgateConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: ShellgateConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_durations_convert() {
        let mut config = ShellgateConfig::default();
        config.registry.kill_grace_ms = 250;
        config.backend.write_timeout_ms = 100;
        assert_eq!(config.registry_config().kill_grace, Duration::from_millis(250));
        assert_eq!(
            config.backend_settings().timeouts.write,
            Duration::from_millis(100)
        );
    }
}
