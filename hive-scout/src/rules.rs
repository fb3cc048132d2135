/**
 * RÈGLES D'AGENT - Manifestes et sauvegarde de déploiement
 *
 * RÔLE : Lit les manifestes `static` et `dynamic` d'un agent et gère le
 * répertoire `backup/` : l'arbre relatif des fichiers statiques qui sert
 * de sauvegarde sur central et de paquet de déploiement vers un outpost.
 */
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::paths::Paths;

/// Static-file manifest of an agent: one path per line, relative to the
/// platform home.
pub fn static_list(paths: &Paths, agent: &str) -> Result<Vec<String>> {
    let manifest = paths.agent_rules(agent).join("static");
    let text = std::fs::read_to_string(&manifest)
        .with_context(|| format!("cannot read static manifest {}", manifest.display()))?;

    Ok(text.lines().map(|l| l.to_string()).collect())
}

/// Dynamic-file manifest, if the agent declares one.
pub fn dynamic_list(paths: &Paths, agent: &str) -> Result<Option<Vec<String>>> {
    let manifest = paths.agent_rules(agent).join("dynamic");
    if !manifest.is_file() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&manifest)?;
    Ok(Some(text.lines().map(|l| l.to_string()).collect()))
}

/// Every file under a path, recursively.
fn collect_files(root: &Path, into: &mut Vec<PathBuf>) -> Result<()> {
    if root.is_file() {
        into.push(root.to_path_buf());
        return Ok(());
    }

    if root.is_dir() {
        for entry in std::fs::read_dir(root)? {
            collect_files(&entry?.path(), into)?;
        }
    }

    Ok(())
}

/// Build the backup staging tree for an agent from its static manifest,
/// preserving the relative structure. Any previous backup is replaced.
pub fn prepare_backup(paths: &Paths, agent: &str) -> Result<()> {
    info!("preparing backup for agent {agent}");

    let backup_dir = paths.backup_dir(agent);
    if backup_dir.is_dir() {
        std::fs::remove_dir_all(&backup_dir)?;
    }
    std::fs::create_dir_all(&backup_dir)?;

    let mut sources = Vec::new();
    for rel in static_list(paths, agent)? {
        collect_files(&paths.home.join(&rel), &mut sources)?;
    }

    for src in sources {
        let rel = src
            .strip_prefix(&paths.home)
            .context("static file escapes the platform home")?;
        let dst = backup_dir.join(rel);

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst)?;
    }

    Ok(())
}

/// Move the backup tree back into the platform home (migration to central).
pub fn restore_backup(paths: &Paths, agent: &str) -> Result<bool> {
    info!("restoring backup of agent {agent}");

    let backup_dir = paths.backup_dir(agent);
    if !backup_dir.is_dir() {
        error!("backup for agent {agent} does not exist");
        return Ok(false);
    }

    let mut sources = Vec::new();
    for rel in static_list(paths, agent)? {
        collect_files(&backup_dir.join(&rel), &mut sources)?;
    }

    for src in sources {
        let rel = src
            .strip_prefix(&backup_dir)
            .context("backup file escapes the staging tree")?;
        let dst = paths.home.join(rel);

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&src, &dst)?;
    }

    Ok(true)
}

/// Remove the agent's static files from the platform home.
pub fn remove_local_files(paths: &Paths, agent: &str) -> Result<()> {
    info!("removing local files of agent {agent}");

    for rel in static_list(paths, agent)? {
        let real_path = paths.home.join(&rel);

        if real_path.is_dir() {
            std::fs::remove_dir_all(&real_path)?;
        } else if real_path.is_file() {
            std::fs::remove_file(&real_path)?;
        }
    }

    Ok(())
}
