//! Control-plane actions executed on the outpost
//!
//! Implements the orders received from the scout:
//! - Resource gathering for hosted agents (`gather-agents`)
//! - Users file refresh (`refresh-users`)
//! - Agent registry updates (`add-agent`, `rm-agent`)
//! - Static file cleanup after a migration (`clean`)
//! - Agent lifecycle through the outpost launcher (`launch`, `stop`)

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{error, info, warn};

use hive_core::{sampler, serial, Envelope, IniFile};

use crate::config::{OutpostConfig, OutpostPaths};

/// Sample every hosted agent and build the `agents-gathered` reply.
pub async fn gather_agents(
    config: &OutpostConfig,
    paths: &OutpostPaths,
    agents: &[String],
) -> Envelope {
    info!("gathering MIPS");

    let info =
        sampler::gather_agent_mips(agents, &config.outpost.perf_path, &paths.var).await;

    let mut reply = Envelope::from_pairs(&[("dst", "scout"), ("tag", "agents-gathered")]);
    for (key, value) in &info {
        reply.push(key, value);
    }
    reply
}

/// Overwrite the local users file with the blob shipped from central.
pub fn refresh_users(paths: &OutpostPaths, blob: &str) -> Result<()> {
    info!("refreshing users list");

    let updated = serial::deserialize_str(blob).context("unreadable users blob")?;
    std::fs::write(&paths.users_conf, updated)
        .with_context(|| format!("cannot write {}", paths.users_conf.display()))?;

    Ok(())
}

/// Register an incoming agent in the platform configuration.
pub fn add_agent(conf: &mut IniFile, agent: &str, port: &str) {
    conf.set(&format!("agent {agent}"), "port", port);
}

/// Drop an agent from the configuration and remove its leftovers.
pub fn rm_agent(conf: &mut IniFile, paths: &OutpostPaths, agent: &str) {
    info!("removing agent {agent}");

    conf.remove_section(&format!("agent {agent}"));

    let agent_dir = paths.agents_dir.join(agent);
    if agent_dir.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(&agent_dir) {
            error!("failed to remove agent directory: {e}");
        }
    }

    let pid_file = paths.pid_file(agent);
    if pid_file.is_file() {
        if let Err(e) = std::fs::remove_file(&pid_file) {
            error!("failed to remove agent PID file: {e}");
        }
    }
}

/// Remove migrated static files, given as paths relative to the home.
pub fn clean_static(paths: &OutpostPaths, rel_paths: &[&str]) {
    for rel in rel_paths {
        let abs_path = paths.home.join(rel);

        let result = if abs_path.is_dir() {
            std::fs::remove_dir_all(&abs_path)
        } else if abs_path.is_file() {
            std::fs::remove_file(&abs_path)
        } else {
            continue;
        };

        if let Err(e) = result {
            error!("failed to remove static files: {e}");
        }
    }
}

/// Launch a hosted agent through the outpost launcher. Refuses agents that
/// are not registered here, already running, or missing their files.
pub async fn launch_agent(conf: &IniFile, paths: &OutpostPaths, agent: &str) -> bool {
    info!("launching agent {agent}");

    if !is_in_outpost(conf, agent) {
        error!("agent {agent} not in outpost");
        return false;
    }
    if is_running(paths, agent) {
        error!("agent {agent} is already running");
        return false;
    }
    if !paths.agents_dir.join(agent).is_dir() {
        error!("agent {agent} does not exist (no files found)");
        return false;
    }

    run_launcher(paths, "launch-agent", agent).await
}

/// Stop a hosted agent through the outpost launcher.
pub async fn stop_agent(conf: &IniFile, paths: &OutpostPaths, agent: &str) -> bool {
    info!("stopping agent {agent}");

    if !is_in_outpost(conf, agent) {
        error!("agent {agent} not in outpost");
        return false;
    }
    if !is_running(paths, agent) {
        error!("agent {agent} is not running");
        return false;
    }

    run_launcher(paths, "stop-agent", agent).await
}

fn is_in_outpost(conf: &IniFile, agent: &str) -> bool {
    conf.section(&format!("agent {agent}")).is_some()
}

fn is_running(paths: &OutpostPaths, agent: &str) -> bool {
    paths.pid_file(agent).is_file()
}

async fn run_launcher(paths: &OutpostPaths, subcommand: &str, agent: &str) -> bool {
    let log = match open_log(paths) {
        Ok(log) => log,
        Err(e) => {
            error!("cannot open outpost log: {e}");
            return false;
        }
    };
    let log_err = match log.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            error!("cannot open outpost log: {e}");
            return false;
        }
    };

    let status = Command::new(&paths.launcher)
        .args([subcommand, agent])
        .current_dir(&paths.home)
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .status()
        .await;

    match status {
        Ok(status) => {
            if !status.success() {
                warn!("launcher {subcommand} {agent} exited with {status}");
            }
            true
        }
        Err(e) => {
            error!("failed to run launcher: {e}");
            false
        }
    }
}

fn open_log(paths: &OutpostPaths) -> Result<std::fs::File> {
    std::fs::create_dir_all(&paths.logs)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.outpost_log())
        .context("cannot open outpost log")
}
