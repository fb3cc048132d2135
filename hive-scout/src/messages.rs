/**
 * MESSAGES - Construction des enveloppes émises par le scout
 *
 * RÔLE : Fabrique les messages du plan de contrôle (cycle de vie des
 * agents, actions outpost) et les rapports texte renvoyés à l'opérateur.
 */
use chrono::DateTime;

use hive_core::Envelope;

use crate::book::{AgentRecord, OutpostRecord};
use crate::config::ConfigStore;
use crate::paths::CENTRAL;

/// Tell an agent that it is about to be moved.
pub fn moving_agent(agent: &str) -> Envelope {
    Envelope::from_pairs(&[("dst", agent), ("tag", "travel!")])
}

/// Tell an agent to terminate.
pub fn terminate_agent(agent: &str) -> Envelope {
    Envelope::from_pairs(&[("dst", agent), ("tag", "exit!")])
}

/// Add an agent to the remote outpost list.
pub fn add_agent(outpost_id: &str, agent: &str, port: &str) -> Envelope {
    Envelope::from_pairs(&[
        ("dst", outpost_id),
        ("action", "add-agent"),
        ("agent", agent),
        ("port", port),
    ])
}

/// Remove an agent from the remote outpost list.
pub fn rm_agent(outpost_id: &str, agent: &str) -> Envelope {
    Envelope::from_pairs(&[
        ("dst", outpost_id),
        ("action", "rm-agent"),
        ("agent", agent),
    ])
}

/// Tell the outpost to remove the given static paths.
pub fn clean_static(outpost_id: &str, paths: &[String]) -> Envelope {
    let mut msg = Envelope::from_pairs(&[("dst", outpost_id)]);
    for path in paths {
        msg.push("paths", path);
    }
    msg.push("action", "clean");
    msg
}

/// Tell the outpost to launch an agent it hosts.
pub fn launch_agent(outpost_id: &str, agent: &str) -> Envelope {
    Envelope::from_pairs(&[
        ("dst", outpost_id),
        ("agent", agent),
        ("action", "launch"),
    ])
}

/// Ask an outpost for the resource usage of its agents.
pub fn outpost_gather_agents(outpost_id: &str) -> Envelope {
    Envelope::from_pairs(&[("dst", outpost_id), ("action", "gather-agents")])
}

/// Ship an up-to-date users file to an outpost.
pub fn refresh_users(outpost_id: &str, users_blob: &str) -> Envelope {
    Envelope::from_pairs(&[
        ("dst", outpost_id),
        ("users", users_blob),
        ("action", "refresh-users"),
    ])
}

/// Force registration of a local agent with the platform server.
pub fn register_local(agent: &str, host: &str, port: &str) -> Envelope {
    Envelope::from_pairs(&[
        ("dst", "server"),
        ("name", agent),
        ("host", host),
        ("port", port),
        ("tag", "register"),
    ])
}

/// Format a book timestamp for operator reports.
fn format_timestamp(epoch: f64) -> String {
    DateTime::from_timestamp(epoch as i64, 0)
        .map(|dt| dt.format("%d-%m-%Y %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Agent locations grouped by outpost, central last.
pub fn feedback_agent_locations(locations: &[(String, Vec<String>)]) -> String {
    let mut msg = String::from("# Agent locations\n\n");

    for (outpost, agents) in locations {
        msg.push_str(&format!("{outpost}\n"));
        msg.push_str("---------\n");
        for agent in agents {
            msg.push_str(&format!("{agent}\n"));
        }
        msg.push('\n');
    }

    msg
}

/// Status of every known agent (hold state, location, last sample).
pub fn feedback_agent_status(agents: &[AgentRecord], hold_list: &[String]) -> String {
    let mut msg = String::from("# Agent status\n\n");

    for agent in agents {
        msg.push_str(&format!("{}\n", agent.name));
        msg.push_str("---------\n");
        if hold_list.iter().any(|h| *h == agent.name) {
            msg.push_str("ON HOLD\n");
        } else {
            msg.push_str("FREE\n");
        }
        msg.push_str(&format!("- Location: {}\n", agent.location));
        msg.push_str(&format!("- MIPS: {}\n", agent.mips));
        msg.push_str(&format!("- Last update: {}\n\n", format_timestamp(agent.timestamp)));
    }

    msg.push('\n');
    msg
}

/// Status of every known outpost. Central reports the balancer settings;
/// outposts no longer in the configuration are skipped.
pub fn feedback_outpost_status(outposts: &[OutpostRecord], config: &ConfigStore) -> String {
    let mut msg = String::from("# Outpost status\n\n");

    for outpost in outposts {
        if outpost.name == CENTRAL {
            let general = config.general();

            msg.push_str(&format!("{}\n", outpost.name));
            msg.push_str("---------\n");
            // If this report is being built, central is alive
            msg.push_str("ONLINE\n");
            msg.push_str(&format!(
                "- Balancer: {}\n",
                general.balance.as_deref().unwrap_or("N/A")
            ));
            msg.push_str(&format!("- MIPS: {}\n", general.mips));
            msg.push_str(&format!("- Priority: {}\n", general.priority));
            msg.push_str(&format!(
                "- Last update: {}\n\n",
                format_timestamp(outpost.timestamp)
            ));
            continue;
        }

        let Some(entry) = config.outpost(&outpost.name) else {
            continue;
        };

        msg.push_str(&format!("{}\n", outpost.name));
        msg.push_str("---------\n");
        msg.push_str(if outpost.is_running { "ONLINE\n" } else { "OFFLINE\n" });
        msg.push_str(&format!("- Host: {}\n", entry.host));
        msg.push_str(&format!("- Remote port: {}\n", entry.remote_port));
        msg.push_str(&format!("- Local tunnel: {}\n", entry.local_tunnel));
        msg.push_str(&format!("- Remote tunnel: {}\n", entry.remote_tunnel));
        msg.push_str(&format!("- Remote directory: {}\n", entry.directory));
        msg.push_str(&format!("- MIPS: {}\n", entry.mips));
        msg.push_str(&format!("- Priority: {}\n", entry.priority));
        msg.push_str(&format!(
            "- Last update: {}\n\n",
            format_timestamp(outpost.timestamp)
        ));
    }

    msg.push('\n');
    msg
}

/// Reply for operators outside the admins group.
pub fn feedback_permissions() -> &'static str {
    "You do not have the required permissions"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_messages() {
        assert_eq!(moving_agent("a1").to_wire(), "dst=a1&tag=travel!");
        assert_eq!(terminate_agent("a1").to_wire(), "dst=a1&tag=exit!");
    }

    #[test]
    fn outpost_control_messages() {
        assert_eq!(
            add_agent("o1", "a1", "30101").to_wire(),
            "dst=o1&action=add-agent&agent=a1&port=30101"
        );
        assert_eq!(
            rm_agent("o1", "a1").to_wire(),
            "dst=o1&action=rm-agent&agent=a1"
        );
        assert_eq!(
            launch_agent("o1", "a1").to_wire(),
            "dst=o1&agent=a1&action=launch"
        );
        assert_eq!(
            outpost_gather_agents("o1").to_wire(),
            "dst=o1&action=gather-agents"
        );
    }

    #[test]
    fn clean_static_lists_every_path() {
        let msg = clean_static("o1", &["agents/a1".into(), "cmdproc/a1.py".into()]);
        assert_eq!(
            msg.to_wire(),
            "dst=o1&paths=agents/a1&paths=cmdproc/a1.py&action=clean"
        );
    }

    #[test]
    fn register_targets_the_server() {
        let msg = register_local("a1", "127.0.0.1", "30101");
        assert_eq!(msg.dst(), Some("server"));
        assert!(msg.has_tag("register"));
        assert_eq!(msg.get("port"), Some("30101"));
    }

    #[test]
    fn locations_report_shape() {
        let report = feedback_agent_locations(&[
            ("o1".into(), vec!["a1".into()]),
            ("central".into(), vec!["a2".into(), "a3".into()]),
        ]);

        assert!(report.starts_with("# Agent locations\n\n"));
        assert!(report.contains("o1\n---------\na1\n"));
        assert!(report.contains("central\n---------\na2\na3\n"));
    }

    #[test]
    fn agent_status_reports_hold_state() {
        let agents = vec![AgentRecord {
            name: "a1".into(),
            mips: 250.0,
            location: "o1".into(),
            timestamp: 0.0,
        }];

        let held = feedback_agent_status(&agents, &["a1".into()]);
        assert!(held.contains("ON HOLD"));
        assert!(held.contains("- Location: o1"));

        let free = feedback_agent_status(&agents, &[]);
        assert!(free.contains("FREE"));
    }
}
