/**
 * PROTOCOLE DE MIGRATION - Déplacement d'un agent entre deux machines
 *
 * RÔLE : Chorégraphie complète du déménagement : notification de l'agent,
 * période de grâce pour la capture d'état, détachement (sauvegarde ou
 * rapatriement des fichiers), rattachement (déploiement + hooks + relance)
 * et validation de la nouvelle position dans le zone book.
 *
 * Toute la chorégraphie se déroule sous le verrou global de migration ;
 * les échecs de transport interrompent le déménagement sans retour en
 * arrière automatique.
 */
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};

use hive_core::IniFile;

use crate::config::OutpostEntry;
use crate::controller::Scout;
use crate::paths::CENTRAL;
use crate::transport::{self, HookStage};
use crate::{messages, rules};

/// Pause between `travel!` and `exit!`, giving the agent time to capture
/// and ship its state.
const TRAVEL_GRACE: Duration = Duration::from_secs(10);

/// Pause between `add-agent` and `launch` on the destination outpost.
const LAUNCH_DELAY: Duration = Duration::from_secs(5);

/// Eligibility rules of a migration request. Returns the resolved current
/// location, or the feedback line for the operator.
pub fn validate(
    agent: &str,
    outpost_id: &str,
    listed: bool,
    dest_known: bool,
    dest_running: Option<bool>,
    location: Option<String>,
) -> Result<String, String> {
    if !listed {
        return Err(format!("agent {agent} cannot migrate"));
    }

    if !dest_known && outpost_id != CENTRAL {
        return Err(format!("unknown outpost: {outpost_id}"));
    }

    let Some(location) = location else {
        return Err(format!("agent {agent} cannot be located"));
    };

    if outpost_id != CENTRAL && dest_running != Some(true) {
        return Err(format!("outpost {outpost_id} is not running/accessible"));
    }

    if location == outpost_id {
        return Err(format!("agent is already in {outpost_id}"));
    }

    Ok(location)
}

fn aborted(agent: &str, cause: impl std::fmt::Display) -> String {
    let msg = format!("migration of agent {agent} aborted: {cause}");
    error!("{msg}");
    msg
}

/// Move an agent to the given outpost (or central). Returns the feedback
/// line for the operator either way.
pub async fn run(scout: &Scout, agent: &str, outpost_id: &str) -> Result<String, String> {
    // Snapshot the configuration the whole move will work with
    let (listed, dest_known, entries) = {
        let config = scout.config.lock().await;

        let entries: HashMap<String, OutpostEntry> = config
            .outpost_names()
            .iter()
            .filter_map(|name| config.outpost(name).map(|e| (name.clone(), e)))
            .collect();

        (
            config.is_listed(agent),
            entries.contains_key(outpost_id),
            entries,
        )
    };

    let (location, dest_running) = {
        let zone = scout.zone_book.lock().await;
        let location = zone
            .agent_location(agent)
            .await
            .map_err(|e| aborted(agent, e))?;
        let dest_running = zone
            .is_running(outpost_id)
            .await
            .map_err(|e| aborted(agent, e))?;
        (location, dest_running)
    };

    let location = validate(agent, outpost_id, listed, dest_known, dest_running, location)
        .inspect_err(|reason| error!("{reason}"))?;

    // The agent's bus port is needed to re-register it on arrival
    let hive_conf = IniFile::load(&scout.paths.hive_conf).map_err(|e| aborted(agent, e))?;
    let port = hive_conf
        .get(&format!("agent {agent}"), "port")
        .ok_or_else(|| format!("agent {agent} has no port configured"))?
        .to_string();

    let _migration = scout.migration.lock().await;

    // Notify the agent, then leave it the grace period to send store-info
    // before asking it to terminate
    info!("notifying {agent} of the migration");
    scout
        .bus
        .send(&messages::moving_agent(agent))
        .await
        .map_err(|e| aborted(agent, e))?;

    tokio::time::sleep(TRAVEL_GRACE).await;

    info!("terminating agent {agent}");
    scout
        .bus
        .send(&messages::terminate_agent(agent))
        .await
        .map_err(|e| aborted(agent, e))?;

    detach(scout, agent, &location, &entries).await?;
    attach(scout, agent, outpost_id, &port, &entries).await?;

    // Commit the new location
    let moved = {
        let zone = scout.zone_book.lock().await;
        zone.move_agent(agent, outpost_id)
            .await
            .map_err(|e| aborted(agent, e))?
    };

    if !moved {
        return Err(format!("failed to move agent {agent}"));
    }

    let msg = format!("agent {agent} moved to {outpost_id}");
    info!("{msg}");
    info!(target: "scout::status", "new location of agent \"{agent}\": {outpost_id}");

    Ok(msg)
}

/// Detach the agent from its current node: stage its files on central, or
/// recall its dynamic files and deregister it from the source outpost.
async fn detach(
    scout: &Scout,
    agent: &str,
    location: &str,
    entries: &HashMap<String, OutpostEntry>,
) -> Result<(), String> {
    if location == CENTRAL {
        rules::prepare_backup(&scout.paths, agent).map_err(|e| aborted(agent, e))?;
        rules::remove_local_files(&scout.paths, agent).map_err(|e| aborted(agent, e))?;
        return Ok(());
    }

    let source = entries
        .get(location)
        .ok_or_else(|| format!("unknown outpost: {location}"))?;

    // The source outpost removes the static files itself
    let static_files = rules::static_list(&scout.paths, agent).map_err(|e| aborted(agent, e))?;
    scout
        .bus
        .send(&messages::clean_static(location, &static_files))
        .await
        .map_err(|e| aborted(agent, e))?;

    // Dynamic files come back to central before redeployment
    if let Some(dynamic) = rules::dynamic_list(&scout.paths, agent).map_err(|e| aborted(agent, e))? {
        let pairs: Vec<(PathBuf, PathBuf)> = dynamic
            .iter()
            .map(|p| {
                (
                    PathBuf::from(&source.directory).join(p),
                    scout.paths.home.join(p),
                )
            })
            .collect();

        transport::scp_get(&pairs, &source.host, source.username.as_deref())
            .await
            .map_err(|e| aborted(agent, e))?;
    }

    scout
        .bus
        .send(&messages::rm_agent(location, agent))
        .await
        .map_err(|e| aborted(agent, e))
}

/// Attach the agent on its destination: deploy and launch on an outpost,
/// or restore the backup and relaunch locally on central.
async fn attach(
    scout: &Scout,
    agent: &str,
    outpost_id: &str,
    port: &str,
    entries: &HashMap<String, OutpostEntry>,
) -> Result<(), String> {
    if outpost_id != CENTRAL {
        let dest = entries
            .get(outpost_id)
            .ok_or_else(|| format!("unknown outpost: {outpost_id}"))?;

        transport::run_remote_commands(&scout.paths, agent, HookStage::PreMigration, dest)
            .await
            .map_err(|e| aborted(agent, e))?;

        // Ship the static tree, then the dynamic files
        let backup = scout.paths.backup_dir(agent);
        transport::scp_put(
            &[(backup, PathBuf::from(&dest.directory))],
            &dest.host,
            dest.username.as_deref(),
        )
        .await
        .map_err(|e| aborted(agent, e))?;

        if let Some(dynamic) =
            rules::dynamic_list(&scout.paths, agent).map_err(|e| aborted(agent, e))?
        {
            let pairs: Vec<(PathBuf, PathBuf)> = dynamic
                .iter()
                .map(|p| {
                    (
                        scout.paths.home.join(p),
                        PathBuf::from(&dest.directory).join(p),
                    )
                })
                .collect();

            transport::scp_put(&pairs, &dest.host, dest.username.as_deref())
                .await
                .map_err(|e| aborted(agent, e))?;
        }

        transport::run_remote_commands(&scout.paths, agent, HookStage::PostMigration, dest)
            .await
            .map_err(|e| aborted(agent, e))?;

        scout
            .bus
            .send(&messages::add_agent(outpost_id, agent, port))
            .await
            .map_err(|e| aborted(agent, e))?;

        // Give the outpost time to persist its new configuration
        tokio::time::sleep(LAUNCH_DELAY).await;

        return scout
            .bus
            .send(&messages::launch_agent(outpost_id, agent))
            .await
            .map_err(|e| aborted(agent, e));
    }

    transport::run_local_commands(&scout.paths, agent, HookStage::PreMigration)
        .await
        .map_err(|e| aborted(agent, e))?;

    if !rules::restore_backup(&scout.paths, agent).map_err(|e| aborted(agent, e))? {
        return Err(aborted(agent, "backup is missing"));
    }

    transport::run_local_commands(&scout.paths, agent, HookStage::PostMigration)
        .await
        .map_err(|e| aborted(agent, e))?;

    scout
        .bus
        .send(&messages::register_local(
            agent,
            &scout.paths.server_host,
            port,
        ))
        .await
        .map_err(|e| aborted(agent, e))?;

    transport::launch_local_agent(&scout.paths, agent)
        .await
        .map_err(|e| aborted(agent, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_agents_cannot_migrate() {
        assert_eq!(
            validate("a1", "o1", false, true, Some(true), Some("central".into())),
            Err("agent a1 cannot migrate".to_string())
        );
    }

    #[test]
    fn unknown_destination_is_reported() {
        assert_eq!(
            validate("a1", "o99", true, false, None, Some("central".into())),
            Err("unknown outpost: o99".to_string())
        );
    }

    #[test]
    fn central_is_always_a_known_destination() {
        assert_eq!(
            validate("a1", "central", true, false, None, Some("o1".into())),
            Ok("o1".to_string())
        );
    }

    #[test]
    fn unresolvable_location_aborts() {
        assert_eq!(
            validate("a1", "o1", true, true, Some(true), None),
            Err("agent a1 cannot be located".to_string())
        );
    }

    #[test]
    fn stopped_outposts_are_not_eligible() {
        assert_eq!(
            validate("a1", "o1", true, true, Some(false), Some("central".into())),
            Err("outpost o1 is not running/accessible".to_string())
        );
        assert_eq!(
            validate("a1", "o1", true, true, None, Some("central".into())),
            Err("outpost o1 is not running/accessible".to_string())
        );
    }

    #[test]
    fn same_location_is_a_no_op() {
        assert_eq!(
            validate("a1", "o1", true, true, Some(true), Some("o1".into())),
            Err("agent is already in o1".to_string())
        );
    }

    #[test]
    fn valid_requests_resolve_the_source() {
        assert_eq!(
            validate("a1", "o1", true, true, Some(true), Some("central".into())),
            Ok("central".to_string())
        );
    }
}
