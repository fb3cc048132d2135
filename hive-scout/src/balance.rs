/**
 * ALGORITHMES D'ÉQUILIBRAGE - Placement des agents sur les outposts
 *
 * RÔLE : Deux fonctions pures qui transforment un instantané ordonné
 * (outposts + agents + MIPS) en affectation cible. Le contrôleur compare
 * ensuite l'affectation aux positions réelles pour décider des migrations.
 *
 * Les charges sont des ratios MIPS(agent) / MIPS(machine) ; les totaux
 * courants sont mis à jour au fil des placements pour que chaque décision
 * voie les précédentes.
 */
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

/// Load ceiling of the priority balancer.
const PRIORITY_LOAD_LIMIT: f64 = 0.8;

/// Location name that the priority balancer falls back to.
const CENTRAL: &str = "central";

/// One outpost (or central) in the balancing snapshot, with the agents it
/// currently hosts. Snapshot order is significant: it breaks ties.
#[derive(Debug, Clone)]
pub struct OutpostSnapshot {
    pub name: String,
    pub mips: f64,
    pub priority: i64,
    pub agents: Vec<AgentSnapshot>,
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub name: String,
    pub location: String,
    pub mips: f64,
    pub is_free: bool,
}

/// Target assignment: every snapshot outpost maps to the agents that should
/// move there (present agents that stay are not listed).
pub type Assignment = BTreeMap<String, Vec<String>>;

type Algorithm = fn(&[OutpostSnapshot]) -> Assignment;

/// Look up a balancing algorithm by its configured name.
pub fn algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "equal" => Some(equal_load),
        "prio" => Some(user_priority),
        _ => None,
    }
}

/// Keep the load of all machines as even as possible: each free agent goes
/// to the machine with the lowest running load at the time it is placed.
pub fn equal_load(snapshot: &[OutpostSnapshot]) -> Assignment {
    let mut result: Assignment = snapshot
        .iter()
        .map(|o| (o.name.clone(), Vec::new()))
        .collect();

    let total_mips: HashMap<&str, f64> =
        snapshot.iter().map(|o| (o.name.as_str(), o.mips)).collect();

    let mut current_load: Vec<(String, f64)> =
        snapshot.iter().map(|o| (o.name.clone(), 0.0)).collect();

    for agent in snapshot.iter().flat_map(|o| o.agents.iter()) {
        let Some(&location_mips) = total_mips.get(agent.location.as_str()) else {
            warn!("agent {} has unknown location {}", agent.name, agent.location);
            continue;
        };
        let ag_load = agent.mips / location_mips;

        if !agent.is_free {
            // Held agents stay put and keep weighing on their machine
            if let Some(entry) = current_load.iter_mut().find(|(n, _)| *n == agent.location) {
                info!("agent \"{}\" on hold in outpost \"{}\"", agent.name, agent.location);
                entry.1 += ag_load;
                debug!("new load of outpost {}: {}", agent.location, entry.1);
            }
            continue;
        }

        // Place on the least loaded machine; stable sort keeps snapshot
        // order for equal loads
        current_load.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let target = current_load[0].0.clone();
        let Some(&target_mips) = total_mips.get(target.as_str()) else {
            continue;
        };
        current_load[0].1 += agent.mips / target_mips;
        debug!("new load of outpost {}: {}", target, current_load[0].1);

        info!("agent \"{}\" will be moved to outpost \"{}\"", agent.name, target);
        if let Some(list) = result.get_mut(&target) {
            list.push(agent.name.clone());
        }
    }

    result
}

/// Fill outposts in priority order (lowest value first), keeping each below
/// 80% of its declared capacity. Agents that fit nowhere are forced onto
/// central regardless of its load.
pub fn user_priority(snapshot: &[OutpostSnapshot]) -> Assignment {
    let mut result: Assignment = snapshot
        .iter()
        .map(|o| (o.name.clone(), Vec::new()))
        .collect();

    let total_mips: HashMap<&str, f64> =
        snapshot.iter().map(|o| (o.name.as_str(), o.mips)).collect();

    let mut current_load: HashMap<&str, f64> =
        snapshot.iter().map(|o| (o.name.as_str(), 0.0)).collect();

    // Stable sort: identical priorities keep snapshot order
    let mut priorities: Vec<(&str, i64)> = snapshot
        .iter()
        .map(|o| (o.name.as_str(), o.priority))
        .collect();
    priorities.sort_by_key(|(_, p)| *p);

    for agent in snapshot.iter().flat_map(|o| o.agents.iter()) {
        let Some(&location_mips) = total_mips.get(agent.location.as_str()) else {
            warn!("agent {} has unknown location {}", agent.name, agent.location);
            continue;
        };

        if !agent.is_free {
            let ag_load = agent.mips / location_mips;
            if let Some(load) = current_load.get_mut(agent.location.as_str()) {
                *load += ag_load;
            }
            continue;
        }

        let mut chosen = false;
        for &(outpost, _) in &priorities {
            let Some(&outpost_mips) = total_mips.get(outpost) else {
                continue;
            };
            let ag_load = agent.mips / outpost_mips;
            let hypo_load = ag_load + current_load.get(outpost).copied().unwrap_or(0.0);

            if hypo_load < PRIORITY_LOAD_LIMIT {
                info!("agent \"{}\" will be moved to outpost \"{}\"", agent.name, outpost);

                if let Some(list) = result.get_mut(outpost) {
                    list.push(agent.name.clone());
                }
                current_load.insert(outpost, hypo_load);
                debug!("new load of outpost {outpost}: {hypo_load}");

                chosen = true;
                break;
            }
        }

        if !chosen {
            info!("forcing migration of \"{}\" to central", agent.name);

            let Some(&central_mips) = total_mips.get(CENTRAL) else {
                warn!("central missing from snapshot, cannot place {}", agent.name);
                continue;
            };
            let ag_load = agent.mips / central_mips;
            *current_load.entry(CENTRAL).or_insert(0.0) += ag_load;

            if let Some(list) = result.get_mut(CENTRAL) {
                list.push(agent.name.clone());
            }
        }
    }

    debug!("balancer result: {result:?}");
    result
}
