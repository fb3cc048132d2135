/**
 * TRANSPORT - SSH, SCP, tunnels et lanceur local
 *
 * RÔLE : Toute interaction avec l'extérieur du processus : exécution de
 * commandes distantes, copie de fichiers, tunnels autossh et pilotage du
 * lanceur de la plateforme.
 *
 * FONCTIONNEMENT : les binaires système (ssh, scp, autossh) sont invoqués
 * directement ; la connexion SSH est bornée à 10 secondes. La sortie du
 * lanceur est ajoutée au journal du scout.
 */
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::OutpostEntry;
use crate::paths::Paths;

/// Placeholder substituted with the outpost home in remote hook commands.
const HOME_PLACEHOLDER: &str = "${HIVE_HOME}";

const SSH_CONNECT_TIMEOUT: &str = "ConnectTimeout=10";

/// Migration hook scripts found in an agent's rules directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreMigration,
    PostMigration,
}

impl HookStage {
    pub fn file_name(self) -> &'static str {
        match self {
            HookStage::PreMigration => "premig",
            HookStage::PostMigration => "postmig",
        }
    }
}

fn ssh_destination(entry: &OutpostEntry) -> String {
    match &entry.username {
        Some(user) => format!("{user}@{}", entry.host),
        None => entry.host.clone(),
    }
}

fn scp_destination(host: &str, username: Option<&str>, path: &Path) -> String {
    match username {
        Some(user) => format!("{user}@{host}:{}", path.display()),
        None => format!("{host}:{}", path.display()),
    }
}

/// Run a command on the outpost over SSH, waiting for the remote exit code.
async fn ssh_exec(entry: &OutpostEntry, command: &str) -> Result<bool> {
    let destination = ssh_destination(entry);
    let status = Command::new("ssh")
        .args(["-o", SSH_CONNECT_TIMEOUT, destination.as_str(), command])
        .status()
        .await
        .context("failed to spawn ssh")?;

    Ok(status.success())
}

/// Open the forward+reverse tunnel to an outpost with autossh.
///
/// The autossh PID lands in `var/<name>.pid` so the platform can stop the
/// tunnel like any other agent. A failed connection leaves no PID file.
pub async fn open_tunnel(paths: &Paths, entry: &OutpostEntry) -> bool {
    info!("opening tunnel for outpost: {}", entry.name);

    let pid_file = paths.pid_file(&entry.name);
    let forward = format!("{}:localhost:{}", entry.local_tunnel, entry.remote_port);
    let reverse = format!("{}:localhost:{}", entry.remote_tunnel, paths.server_port);
    let destination = ssh_destination(entry);

    let status = Command::new("autossh")
        .env("AUTOSSH_GATETIME", "10")
        .env("AUTOSSH_PIDFILE", &pid_file)
        .args([
            "-f",
            "-N",
            "-L",
            forward.as_str(),
            "-R",
            reverse.as_str(),
            destination.as_str(),
        ])
        .status()
        .await;

    let connected = matches!(status, Ok(s) if s.success());
    if !connected {
        error!("could not connect to remote host");

        if pid_file.is_file() {
            if let Err(e) = std::fs::remove_file(&pid_file) {
                warn!("could not remove stale tunnel PID file: {e}");
            }
        }
        return false;
    }

    info!("tunnel is now open");
    true
}

/// Close the SSH tunnel of an outpost through the platform launcher.
/// Reports an error when no tunnel is open, but never panics.
pub async fn close_tunnel(paths: &Paths, name: &str) -> bool {
    if !paths.pid_file(name).is_file() {
        error!("there is no tunnel open for outpost {name}");
        return false;
    }

    if let Err(e) = launcher(paths, "stop-agent", name).await {
        error!("failed to stop tunnel of outpost {name}: {e}");
        return false;
    }

    info!("tunnel to outpost {name} should be closed now");
    true
}

/// Start (or restart) the outpost process on its machine.
pub async fn launch_outpost(entry: &OutpostEntry) -> bool {
    info!("launching outpost: {}", entry.name);

    let command = format!("cd {}; ./outpost.sh restart", entry.directory);
    match ssh_exec(entry, &command).await {
        Ok(ok) => ok,
        Err(e) => {
            error!("error while launching outpost {}: {e}", entry.name);
            false
        }
    }
}

/// Stop the outpost process. Does not touch the tunnel.
pub async fn stop_outpost(entry: &OutpostEntry) -> bool {
    info!("stopping outpost: {}", entry.name);

    let command = format!("cd {}; ./outpost.sh stop", entry.directory);
    match ssh_exec(entry, &command).await {
        Ok(ok) => ok,
        Err(e) => {
            error!("error while stopping outpost {}: {e}", entry.name);
            false
        }
    }
}

/// Copy remote paths to the local machine, recursively.
pub async fn scp_get(
    pairs: &[(PathBuf, PathBuf)],
    host: &str,
    username: Option<&str>,
) -> Result<()> {
    info!("getting remote files from {host}");

    for (src, dst) in pairs {
        let status = Command::new("scp")
            .args(["-o", SSH_CONNECT_TIMEOUT, "-r"])
            .arg(scp_destination(host, username, src))
            .arg(dst)
            .status()
            .await
            .context("failed to spawn scp")?;

        if !status.success() {
            bail!("scp get of {} failed", src.display());
        }
    }

    Ok(())
}

/// Copy local paths to the remote machine. Directories are expanded so
/// their contents land in the destination rather than the directory itself.
pub async fn scp_put(
    pairs: &[(PathBuf, PathBuf)],
    host: &str,
    username: Option<&str>,
) -> Result<()> {
    info!("uploading local files to {host}");

    for (src, dst) in pairs {
        let mut sources = Vec::new();

        if src.is_dir() {
            for entry in std::fs::read_dir(src)
                .with_context(|| format!("cannot list {}", src.display()))?
            {
                sources.push(entry?.path());
            }
        } else {
            sources.push(src.clone());
        }

        for source in sources {
            let status = Command::new("scp")
                .args(["-o", SSH_CONNECT_TIMEOUT, "-r"])
                .arg(&source)
                .arg(scp_destination(host, username, dst))
                .status()
                .await
                .context("failed to spawn scp")?;

            if !status.success() {
                bail!("scp put of {} failed", source.display());
            }
        }
    }

    Ok(())
}

/// Run the hook commands of a migration stage locally, one line at a time.
/// A missing hook file is not an error, there is simply nothing to do.
pub async fn run_local_commands(paths: &Paths, agent: &str, stage: HookStage) -> Result<()> {
    let cmd_file = paths.agent_rules(agent).join(stage.file_name());

    if !cmd_file.is_file() {
        warn!("file for \"{}\" does not exist", stage.file_name());
        return Ok(());
    }

    let script = std::fs::read_to_string(&cmd_file)?;
    for cmd in script.lines().filter(|l| !l.trim().is_empty()) {
        info!("executing: {cmd}");

        let status = Command::new("sh")
            .args(["-c", cmd])
            .current_dir(&paths.home)
            .status()
            .await
            .context("failed to spawn hook command")?;

        if !status.success() {
            warn!("hook command exited with {status}");
        }
    }

    Ok(())
}

/// Run the hook commands of a migration stage on the outpost over SSH,
/// with the home placeholder replaced by the outpost directory.
pub async fn run_remote_commands(
    paths: &Paths,
    agent: &str,
    stage: HookStage,
    entry: &OutpostEntry,
) -> Result<()> {
    let cmd_file = paths.agent_rules(agent).join(stage.file_name());

    if !cmd_file.is_file() {
        warn!("file for \"{}\" does not exist", stage.file_name());
        return Ok(());
    }

    let script = std::fs::read_to_string(&cmd_file)?;
    for cmd in script.lines().filter(|l| !l.trim().is_empty()) {
        info!("executing: {cmd}");

        let cmd = cmd.replace(HOME_PLACEHOLDER, &entry.directory);
        let remote = format!("cd {}; {}", entry.directory, cmd);

        if !ssh_exec(entry, &remote).await? {
            warn!("remote hook command failed: {cmd}");
        }
    }

    Ok(())
}

/// Launch a local agent through the platform launcher.
pub async fn launch_local_agent(paths: &Paths, agent: &str) -> Result<()> {
    info!("launching agent {agent}");
    launcher(paths, "launch-agent", agent).await
}

/// Stop a local agent through the platform launcher.
pub async fn stop_local_agent(paths: &Paths, agent: &str) -> Result<()> {
    info!("stopping agent {agent}");
    launcher(paths, "stop-agent", agent).await
}

/// Invoke the platform launcher, folding its output into the scout log.
async fn launcher(paths: &Paths, subcommand: &str, name: &str) -> Result<()> {
    std::fs::create_dir_all(&paths.logs)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.scout_log())
        .context("cannot open scout log")?;

    let status = Command::new(&paths.launcher)
        .args([subcommand, name])
        .current_dir(&paths.home)
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .status()
        .await
        .with_context(|| format!("failed to run launcher {}", paths.launcher.display()))?;

    if !status.success() {
        bail!("launcher {subcommand} {name} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::for_home(
            dir.path().to_path_buf(),
            dir.path().join("var"),
            dir.path().join("logs"),
            "127.0.0.1".into(),
            30000,
        )
        .unwrap();
        std::fs::create_dir_all(&paths.var).unwrap();
        (dir, paths)
    }

    #[tokio::test]
    async fn close_tunnel_without_pid_file_reports_error() {
        let (_dir, paths) = test_paths();
        assert!(!close_tunnel(&paths, "vault").await);
    }

    #[tokio::test]
    async fn local_hooks_run_in_the_platform_home() {
        let (_dir, paths) = test_paths();
        let rules = paths.agent_rules("a1");
        std::fs::create_dir_all(&rules).unwrap();
        std::fs::write(rules.join("premig"), "touch premig-ran\n").unwrap();

        run_local_commands(&paths, "a1", HookStage::PreMigration)
            .await
            .unwrap();

        assert!(paths.home.join("premig-ran").is_file());
    }

    #[tokio::test]
    async fn missing_hook_file_is_not_an_error() {
        let (_dir, paths) = test_paths();
        std::fs::create_dir_all(paths.agent_rules("a1")).unwrap();

        assert!(run_local_commands(&paths, "a1", HookStage::PostMigration)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn launcher_output_lands_in_the_scout_log() {
        let (_dir, mut paths) = test_paths();

        let launcher = paths.home.join("hive.sh");
        std::fs::write(&launcher, "#!/bin/sh\necho \"launcher: $1 $2\"\n").unwrap();
        let mut perms = std::fs::metadata(&launcher).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&launcher, perms).unwrap();
        paths.launcher = launcher;

        launch_local_agent(&paths, "a1").await.unwrap();

        let log = std::fs::read_to_string(paths.scout_log()).unwrap();
        assert!(log.contains("launcher: launch-agent a1"));
    }
}
