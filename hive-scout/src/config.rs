/**
 * CONFIGURATION SCOUT - Liste des outposts et réglages du balancer
 *
 * RÔLE : Tient en mémoire les deux fichiers ini du scout (scout.conf et
 * outpost.list) et les réécrit à chaque mutation. Le magasin entier vit
 * derrière un seul verrou côté contrôleur.
 *
 * FONCTIONNEMENT : listes free/hold en tokens séparés par des espaces,
 * sections `outpost <nom>` pour les machines distantes. Central tire sa
 * capacité et sa priorité de la section `general`.
 */
use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info};

use hive_core::IniFile;

/// Typed view over an `outpost <name>` section.
#[derive(Debug, Clone)]
pub struct OutpostEntry {
    pub name: String,
    pub host: String,
    pub username: Option<String>,
    pub directory: String,
    pub remote_port: u16,
    pub local_tunnel: u16,
    pub remote_tunnel: u16,
    pub mips: f64,
    pub priority: i64,
}

/// Typed view over the `[general]` section of scout.conf.
#[derive(Debug, Clone)]
pub struct GeneralConf {
    /// Selected balancing algorithm; `None` disables balancing.
    pub balance: Option<String>,
    pub mips: f64,
    pub priority: i64,
    pub perf_path: String,
}

pub struct ConfigStore {
    scout_path: PathBuf,
    outposts_path: PathBuf,
    scout: IniFile,
    outposts: IniFile,
}

impl ConfigStore {
    pub fn load(scout_path: PathBuf, outposts_path: PathBuf) -> Result<Self> {
        Ok(Self {
            scout: IniFile::load(&scout_path)?,
            outposts: IniFile::load(&outposts_path)?,
            scout_path,
            outposts_path,
        })
    }

    pub fn outpost_names(&self) -> Vec<String> {
        self.outposts.section_names("outpost ")
    }

    pub fn outpost(&self, name: &str) -> Option<OutpostEntry> {
        let section = self.outposts.section(&format!("outpost {name}"))?;

        Some(OutpostEntry {
            name: name.to_string(),
            host: section.get("host").unwrap_or_default().to_string(),
            username: section.get("username").map(|u| u.to_string()),
            directory: section.get("directory").unwrap_or_default().to_string(),
            remote_port: section.get_u16("remote_port").unwrap_or(0),
            local_tunnel: section.get_u16("local_tunnel").unwrap_or(0),
            remote_tunnel: section.get_u16("remote_tunnel").unwrap_or(0),
            mips: section.get_f64("mips").unwrap_or(0.0),
            priority: section.get_i64("priority").unwrap_or(0),
        })
    }

    pub fn general(&self) -> GeneralConf {
        let balance = self
            .scout
            .get("general", "balance")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string());

        GeneralConf {
            balance,
            mips: self
                .scout
                .section("general")
                .and_then(|s| s.get_f64("mips"))
                .unwrap_or(0.0),
            priority: self
                .scout
                .section("general")
                .and_then(|s| s.get_i64("priority"))
                .unwrap_or(0),
            perf_path: self
                .scout
                .get("general", "perf_path")
                .unwrap_or("perf")
                .to_string(),
        }
    }

    pub fn free_list(&self) -> Vec<String> {
        split_tokens(self.scout.get("agents", "free"))
    }

    pub fn hold_list(&self) -> Vec<String> {
        split_tokens(self.scout.get("agents", "hold"))
    }

    /// Whether an agent may migrate at all (listed as free or hold).
    pub fn is_listed(&self, agent: &str) -> bool {
        self.free_list().iter().any(|a| a == agent)
            || self.hold_list().iter().any(|a| a == agent)
    }

    pub fn is_free(&self, agent: &str) -> bool {
        self.free_list().iter().any(|a| a == agent)
    }

    /// Move an agent from the free list to the hold list.
    pub fn mark_hold(&mut self, agent: &str) -> Result<(), String> {
        let mut free = self.free_list();
        let mut hold = self.hold_list();

        if hold.iter().any(|a| a == agent) {
            let reason = format!("agent {agent} is already in hold list");
            error!("{reason}");
            return Err(reason);
        }
        if !free.iter().any(|a| a == agent) {
            let reason = format!("agent {agent} not found in free list");
            error!("{reason}");
            return Err(reason);
        }

        free.retain(|a| a != agent);
        hold.push(agent.to_string());
        self.write_lists(&free, &hold)?;

        info!("agent {agent} is now on hold");
        Ok(())
    }

    /// Move an agent from the hold list back to the free list.
    pub fn mark_unhold(&mut self, agent: &str) -> Result<(), String> {
        let mut free = self.free_list();
        let mut hold = self.hold_list();

        if free.iter().any(|a| a == agent) {
            let reason = format!("agent {agent} is already in free list");
            error!("{reason}");
            return Err(reason);
        }
        if !hold.iter().any(|a| a == agent) {
            let reason = format!("agent {agent} not found in hold list");
            error!("{reason}");
            return Err(reason);
        }

        hold.retain(|a| a != agent);
        free.push(agent.to_string());
        self.write_lists(&free, &hold)?;

        info!("agent {agent} is now free");
        Ok(())
    }

    /// Reconcile free/hold with the agents seen in the rules directory:
    /// newly observed agents join the free list, unknown names are dropped
    /// from both lists.
    pub fn refresh_agents(&mut self, known: &[String]) -> Result<()> {
        info!("refreshing scout configuration");

        let mut remaining: Vec<String> = known.to_vec();

        let hold: Vec<String> = self
            .hold_list()
            .into_iter()
            .filter(|a| {
                let keep = remaining.contains(a);
                if keep {
                    remaining.retain(|r| r != a);
                }
                keep
            })
            .collect();

        let mut free: Vec<String> = self
            .free_list()
            .into_iter()
            .filter(|a| {
                let keep = remaining.contains(a);
                if keep {
                    remaining.retain(|r| r != a);
                }
                keep
            })
            .collect();

        // Agents never seen before become movable by default
        free.extend(remaining);

        self.write_lists(&free, &hold)
            .map_err(anyhow::Error::msg)?;
        Ok(())
    }

    fn write_lists(&mut self, free: &[String], hold: &[String]) -> Result<(), String> {
        self.scout.set("agents", "free", &free.join(" "));
        self.scout.set("agents", "hold", &hold.join(" "));
        self.persist_scout()
    }

    fn persist_scout(&self) -> Result<(), String> {
        self.scout
            .save(&self.scout_path)
            .map_err(|e| format!("cannot persist scout configuration: {e}"))
    }

    /// Reload the outpost list from disk (picked up by the refresh timer
    /// when the operator edits the file).
    pub fn reload_outposts(&mut self) -> Result<()> {
        self.outposts = IniFile::load(&self.outposts_path)?;
        Ok(())
    }
}

fn split_tokens(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOUT_CONF: &str = "\
[general]
balance = prio
mips = 3000
priority = 10
perf_path = /usr/bin/perf

[agents]
free = a1
hold =
";

    const OUTPOST_LIST: &str = "\
[outpost o1]
host = o1.example.org
directory = /opt/hive
remote_port = 30000
local_tunnel = 30100
remote_tunnel = 30200
mips = 1000
priority = 1
";

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let scout_path = dir.path().join("scout.conf");
        let outposts_path = dir.path().join("outpost.list");
        std::fs::write(&scout_path, SCOUT_CONF).unwrap();
        std::fs::write(&outposts_path, OUTPOST_LIST).unwrap();
        let store = ConfigStore::load(scout_path, outposts_path).unwrap();
        (dir, store)
    }

    #[test]
    fn typed_views_over_the_ini_files() {
        let (_dir, store) = store();

        let general = store.general();
        assert_eq!(general.balance.as_deref(), Some("prio"));
        assert_eq!(general.mips, 3000.0);
        assert_eq!(general.perf_path, "/usr/bin/perf");

        let outpost = store.outpost("o1").unwrap();
        assert_eq!(outpost.host, "o1.example.org");
        assert_eq!(outpost.username, None);
        assert_eq!(outpost.priority, 1);
        assert!(store.outpost("o99").is_none());
        assert_eq!(store.outpost_names(), vec!["o1"]);
    }

    #[test]
    fn hold_and_unhold_roundtrip() {
        let (_dir, mut store) = store();

        assert!(store.mark_hold("a1").is_ok());
        assert_eq!(store.free_list(), Vec::<String>::new());
        assert_eq!(store.hold_list(), vec!["a1"]);

        // Second hold reports the precondition violation
        assert_eq!(
            store.mark_hold("a1"),
            Err("agent a1 is already in hold list".to_string())
        );

        assert!(store.mark_unhold("a1").is_ok());
        assert_eq!(store.free_list(), vec!["a1"]);
        assert!(store.hold_list().is_empty());

        assert_eq!(
            store.mark_unhold("a1"),
            Err("agent a1 is already in free list".to_string())
        );
    }

    #[test]
    fn hold_requires_listed_agent() {
        let (_dir, mut store) = store();
        assert_eq!(
            store.mark_hold("ghost"),
            Err("agent ghost not found in free list".to_string())
        );
        assert_eq!(
            store.mark_unhold("ghost"),
            Err("agent ghost not found in hold list".to_string())
        );
    }

    #[test]
    fn hold_precedence_over_missing_free_entry() {
        let (_dir, mut store) = store();
        store.mark_hold("a1").unwrap();
        // Corrupt state on purpose: a1 in both lists
        store.scout.set("agents", "free", "a1");
        assert_eq!(
            store.mark_hold("a1"),
            Err("agent a1 is already in hold list".to_string())
        );
    }

    #[test]
    fn refresh_appends_new_agents_to_free() {
        let (_dir, mut store) = store();
        store.mark_hold("a1").unwrap();

        store
            .refresh_agents(&["a1".into(), "a2".into(), "a3".into()])
            .unwrap();

        assert_eq!(store.hold_list(), vec!["a1"]);
        assert_eq!(store.free_list(), vec!["a2", "a3"]);
    }

    #[test]
    fn refresh_drops_unknown_agents() {
        let (_dir, mut store) = store();

        store.refresh_agents(&["a2".into()]).unwrap();

        assert_eq!(store.free_list(), vec!["a2"]);
        assert!(store.hold_list().is_empty());
    }

    #[test]
    fn mutations_are_persisted() {
        let (dir, mut store) = store();
        store.mark_hold("a1").unwrap();

        let reloaded = ConfigStore::load(
            dir.path().join("scout.conf"),
            dir.path().join("outpost.list"),
        )
        .unwrap();
        assert_eq!(reloaded.hold_list(), vec!["a1"]);
    }
}
