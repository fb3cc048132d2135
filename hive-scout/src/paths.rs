/**
 * CHEMINS PLATEFORME - Arborescence des fichiers du scout
 *
 * RÔLE : Résout tous les chemins utilisés par le contrôleur à partir des
 * variables d'environnement HIVE_HOME / HIVE_VAR / HIVE_LOGS.
 *
 * UTILITÉ : Un seul point de vérité pour l'arborescence, injectable dans
 * les tests avec un répertoire temporaire.
 */
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Reserved location name for the node running the controller.
pub const CENTRAL: &str = "central";

#[derive(Debug, Clone)]
pub struct Paths {
    /// Platform home (`HIVE_HOME`).
    pub home: PathBuf,
    /// PID files for live agents and open tunnels (`HIVE_VAR`).
    pub var: PathBuf,
    /// Log directory (`HIVE_LOGS`).
    pub logs: PathBuf,
    /// `etc/scout` configuration root.
    pub etc_scout: PathBuf,
    /// Per-agent rules directories.
    pub rules: PathBuf,
    pub agent_book_db: PathBuf,
    pub zone_book_db: PathBuf,
    pub scout_conf: PathBuf,
    pub outpost_list: PathBuf,
    /// Platform configuration with the `agent <name>` port registry.
    pub hive_conf: PathBuf,
    /// Users file broadcast to the outposts.
    pub users_conf: PathBuf,
    /// Platform launcher script.
    pub launcher: PathBuf,
    /// Central bus server address.
    pub server_host: String,
    pub server_port: u16,
}

impl Paths {
    /// Resolve the layout from the environment. Fails when the platform
    /// home is missing, which is fatal for the controller.
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
        let server_host =
            std::env::var("HIVE_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let server_port = std::env::var("HIVE_SERVER_PORT")
            .context("HIVE_SERVER_PORT is not set")?
            .parse()
            .context("HIVE_SERVER_PORT is not a port number")?;

        Self::for_home(home, var, logs, server_host, server_port)
    }

    /// Build the layout from explicit roots (tests use temp directories).
    pub fn for_home(
        home: PathBuf,
        var: PathBuf,
        logs: PathBuf,
        server_host: String,
        server_port: u16,
    ) -> Result<Self> {
        if !home.is_dir() {
            bail!("platform home {} does not exist", home.display());
        }

        let etc_scout = home.join("etc").join("scout");

        // Launcher is either `hive` or the fallback `hive.sh`
        let launcher = {
            let script = home.join("hive");
            if script.is_file() {
                script
            } else {
                home.join("hive.sh")
            }
        };

        Ok(Self {
            agent_book_db: etc_scout.join("agentbook.sqlite"),
            zone_book_db: etc_scout.join("zonebook.sqlite"),
            scout_conf: etc_scout.join("scout.conf"),
            outpost_list: etc_scout.join("outpost.list"),
            rules: etc_scout.join("rules"),
            hive_conf: home.join("etc").join("hive.conf"),
            users_conf: home.join("etc").join("hive-users.conf"),
            etc_scout,
            launcher,
            home,
            var,
            logs,
            server_host,
            server_port,
        })
    }

    /// PID file acting as the liveness token for an agent or a tunnel.
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.var.join(format!("{name}.pid"))
    }

    /// Rules directory of a given agent.
    pub fn agent_rules(&self, agent: &str) -> PathBuf {
        self.rules.join(agent)
    }

    /// Backup staging tree of a given agent.
    pub fn backup_dir(&self, agent: &str) -> PathBuf {
        self.agent_rules(agent).join("backup")
    }

    /// Main scout log, also collects launcher output.
    pub fn scout_log(&self) -> PathBuf {
        self.logs.join("scout.log")
    }

    /// Names of the agents that have a rules directory.
    pub fn rules_agents(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.rules)
            .with_context(|| format!("cannot list rules directory {}", self.rules.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
