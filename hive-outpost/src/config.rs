//! Outpost bootstrap configuration
//!
//! Handles:
//! - The outpost's own identity and profiler path
//! - How to reach the central server (usually through the SSH tunnel)
//! - The local file layout derived from the platform home

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutpostConfig {
    pub outpost: OutpostSection,
    pub central: CentralSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutpostSection {
    /// Unique outpost id, as listed on central.
    pub id: String,
    /// Path to the profiler used for gather-agents requests.
    pub perf_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSection {
    /// Address the outpost uses to reach the central server. With a
    /// reverse tunnel in place this is localhost and the tunnel port.
    pub host: String,
    pub port: u16,
    /// Tunnel port on central that reaches this outpost's bus, sent along
    /// with agent registrations.
    pub tunnel: u16,
}

impl OutpostConfig {
    /// Load the configuration from `OUTPOST_CONFIG`, falling back to
    /// `etc/outpost/outpost.toml` under the platform home.
    pub async fn load(home: &PathBuf) -> Result<Self> {
        let path = std::env::var("OUTPOST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("etc").join("outpost").join("outpost.toml"));

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read outpost config {}", path.display()))?;

        toml::from_str(&content).with_context(|| format!("invalid outpost config {}", path.display()))
    }
}

/// File layout of an outpost node.
#[derive(Debug, Clone)]
pub struct OutpostPaths {
    pub home: PathBuf,
    pub var: PathBuf,
    pub logs: PathBuf,
    /// Platform agent registry (`agent <name>` sections).
    pub hive_conf: PathBuf,
    pub users_conf: PathBuf,
    /// Directory holding the deployed agents.
    pub agents_dir: PathBuf,
    /// Outpost launcher script.
    pub launcher: PathBuf,
    /// Local bus bind address.
    pub bind_host: String,
    pub bind_port: u16,
}

impl OutpostPaths {
    pub fn from_env() -> Result<Self> {
        let home = PathBuf::from(
            std::env::var("HIVE_HOME").context("HIVE_HOME is not set")?,
        );
        let var = std::env::var("HIVE_VAR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("var"));
        let logs = std::env::var("HIVE_LOGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("logs"));
        let bind_host =
            std::env::var("HIVE_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let bind_port = std::env::var("HIVE_SERVER_PORT")
            .context("HIVE_SERVER_PORT is not set")?
            .parse()
            .context("HIVE_SERVER_PORT is not a port number")?;

        Self::for_home(home, var, logs, bind_host, bind_port)
    }

    pub fn for_home(
        home: PathBuf,
        var: PathBuf,
        logs: PathBuf,
        bind_host: String,
        bind_port: u16,
    ) -> Result<Self> {
        if !home.is_dir() {
            bail!("platform home {} does not exist", home.display());
        }

        Ok(Self {
            hive_conf: home.join("etc").join("hive.conf"),
            users_conf: home.join("etc").join("hive-users.conf"),
            agents_dir: home.join("agents"),
            launcher: home.join("outpost.sh"),
            home,
            var,
            logs,
            bind_host,
            bind_port,
        })
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.var.join(format!("{name}.pid"))
    }

    pub fn outpost_log(&self) -> PathBuf {
        self.logs.join("outpost.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_from_toml() {
        let config: OutpostConfig = toml::from_str(
            "\
[outpost]
id = \"vault\"
perf_path = \"/usr/bin/perf\"

[central]
host = \"localhost\"
port = 30200
tunnel = 30100
",
        )
        .unwrap();

        assert_eq!(config.outpost.id, "vault");
        assert_eq!(config.central.port, 30200);
        assert_eq!(config.central.tunnel, 30100);
    }

    #[test]
    fn layout_derives_from_home() {
        let dir = tempfile::tempdir().unwrap();
        let paths = OutpostPaths::for_home(
            dir.path().to_path_buf(),
            dir.path().join("var"),
            dir.path().join("logs"),
            "127.0.0.1".into(),
            30000,
        )
        .unwrap();

        assert!(paths.hive_conf.ends_with("etc/hive.conf"));
        assert!(paths.pid_file("a1").ends_with("var/a1.pid"));
        assert!(paths.launcher.ends_with("outpost.sh"));
    }
}
