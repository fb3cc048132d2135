//! Message routing for the outpost dispatcher
//!
//! Decides what to do with a message that is not for the outpost itself:
//! deliver to a hosted agent (known port), learn the port from the
//! platform configuration, or relay to central. Relayed messages carry a
//! replay counter so a destination nobody knows cannot loop forever.

use std::collections::HashMap;

use hive_core::{Envelope, IniFile};

/// Replay ceiling: a message that reaches this count is dropped.
pub const MAX_REPLAY: i64 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision {
    /// Deliver to a local agent. `learned` is set when the port came from
    /// the configuration and should be cached in the router.
    Deliver { port: u16, learned: bool },
    /// Forward to central with the replay counter bumped.
    Relay(Envelope),
    /// Replay ceiling reached: drop without opening a socket.
    Discard,
}

pub fn decide(
    router: &HashMap<String, u16>,
    conf: &IniFile,
    dest: &str,
    msg: &Envelope,
) -> RouteDecision {
    if let Some(&port) = router.get(dest) {
        return RouteDecision::Deliver {
            port,
            learned: false,
        };
    }

    // Not in the router, maybe the configuration knows the agent
    if let Some(port) = conf
        .section(&format!("agent {dest}"))
        .and_then(|s| s.get_u16("port"))
        .filter(|&p| p != 0)
    {
        return RouteDecision::Deliver {
            port,
            learned: true,
        };
    }

    // Unknown destination: relay to central, bounded by the replay counter
    let replay: i64 = msg
        .get("_outpost_replay")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if replay >= MAX_REPLAY {
        return RouteDecision::Discard;
    }

    let mut relayed = msg.clone();
    relayed.set("_outpost_replay", &(replay + 1).to_string());
    RouteDecision::Relay(relayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> IniFile {
        IniFile::parse("[agent a2]\nport = 30102\n\n[agent broken]\nport = 0\n")
    }

    #[test]
    fn router_entries_win() {
        let mut router = HashMap::new();
        router.insert("a1".to_string(), 30101u16);

        let msg = Envelope::parse("dst=a1&tag=ping").unwrap();
        assert_eq!(
            decide(&router, &conf(), "a1", &msg),
            RouteDecision::Deliver {
                port: 30101,
                learned: false
            }
        );
    }

    #[test]
    fn configuration_ports_are_learned() {
        let msg = Envelope::parse("dst=a2&tag=ping").unwrap();
        assert_eq!(
            decide(&HashMap::new(), &conf(), "a2", &msg),
            RouteDecision::Deliver {
                port: 30102,
                learned: true
            }
        );
    }

    #[test]
    fn zero_port_is_not_a_destination() {
        let msg = Envelope::parse("dst=broken&tag=ping").unwrap();
        match decide(&HashMap::new(), &conf(), "broken", &msg) {
            RouteDecision::Relay(_) => {}
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[test]
    fn unknown_destinations_relay_with_a_bumped_counter() {
        let msg = Envelope::parse("dst=ghost&tag=ping").unwrap();
        match decide(&HashMap::new(), &conf(), "ghost", &msg) {
            RouteDecision::Relay(relayed) => {
                assert_eq!(relayed.get("_outpost_replay"), Some("1"));
                assert_eq!(relayed.dst(), Some("ghost"));
            }
            other => panic!("expected relay, got {other:?}"),
        }

        let msg = Envelope::parse("dst=ghost&tag=ping&_outpost_replay=3").unwrap();
        match decide(&HashMap::new(), &conf(), "ghost", &msg) {
            RouteDecision::Relay(relayed) => {
                assert_eq!(relayed.get("_outpost_replay"), Some("4"));
            }
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[test]
    fn replay_ceiling_discards_the_message() {
        let msg = Envelope::parse("dst=ghost&tag=ping&_outpost_replay=5").unwrap();
        assert_eq!(
            decide(&HashMap::new(), &conf(), "ghost", &msg),
            RouteDecision::Discard
        );

        let msg = Envelope::parse("dst=ghost&tag=ping&_outpost_replay=9").unwrap();
        assert_eq!(
            decide(&HashMap::new(), &conf(), "ghost", &msg),
            RouteDecision::Discard
        );
    }
}
