/*!
Agent de test migrable

Reproduit le comportement côté agent du protocole de migration : capture de
l'état sur `travel!`, restauration sur `settle!`, et réécriture différée de
tout message reçu pendant le voyage. Sert aux tests d'intégration du
contrôleur.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hive_core::envelope::{defer_rewrite, SCOUT_NAME};
use hive_core::{serial, Envelope};

/// In-memory state that must survive a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelerState {
    pub counter: u64,
    pub note: String,
}

/// Minimal migratable agent with an explicit snapshot/restore contract.
pub struct TravelerAgent {
    name: String,
    state: TravelerState,
    travelling: bool,
}

impl TravelerAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: TravelerState::default(),
            travelling: false,
        }
    }

    pub fn state(&self) -> &TravelerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut TravelerState {
        &mut self.state
    }

    pub fn is_travelling(&self) -> bool {
        self.travelling
    }

    /// Capture the in-memory state as bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.state).context("cannot capture agent state")
    }

    /// Restore a previously captured state.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.state = serde_json::from_slice(bytes).context("cannot restore agent state")?;
        Ok(())
    }

    /// Ask the scout for stored state, as a freshly started agent would.
    pub fn retrieve_info_request(&self) -> Envelope {
        Envelope::from_pairs(&[
            ("dst", SCOUT_NAME),
            ("tag", "retrieve-info"),
            ("agent", self.name.as_str()),
        ])
    }

    /// React to an incoming bus message, returning the messages the agent
    /// sends in response.
    pub fn handle(&mut self, msg: &Envelope) -> Result<Vec<Envelope>> {
        if msg.has_tag("travel!") && !self.travelling {
            self.travelling = true;

            let blob = serial::serialize(&self.snapshot()?);
            let store = Envelope::from_pairs(&[
                ("dst", SCOUT_NAME),
                ("tag", "store-info"),
                ("agent", self.name.as_str()),
                ("state", blob.as_str()),
            ]);
            return Ok(vec![store]);
        }

        if msg.has_tag("settle!") {
            if let Some(blob) = msg.get("state") {
                self.restore(&serial::deserialize(blob)?)?;
            }
            self.travelling = false;

            let retrieve = Envelope::from_pairs(&[
                ("dst", SCOUT_NAME),
                ("tag", "retrieve-msg"),
                ("agent", self.name.as_str()),
            ]);
            return Ok(vec![retrieve]);
        }

        if self.travelling {
            // Anything received mid-move is handed back to the scout
            return Ok(vec![defer_rewrite(msg)]);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_captures_state_for_the_scout() {
        let mut agent = TravelerAgent::new("a1");
        agent.state_mut().counter = 7;
        agent.state_mut().note = "hello".into();

        let out = agent
            .handle(&Envelope::parse("dst=a1&tag=travel!").unwrap())
            .unwrap();

        assert!(agent.is_travelling());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst(), Some("scout"));
        assert!(out[0].has_tag("store-info"));
        assert_eq!(out[0].get("agent"), Some("a1"));

        // A second travel! while already travelling is deferred instead
        let again = agent
            .handle(&Envelope::parse("dst=a1&tag=travel!").unwrap())
            .unwrap();
        assert!(again[0].has_tag("store-msg"));
    }

    #[test]
    fn settle_restores_the_captured_state() {
        let mut source = TravelerAgent::new("a1");
        source.state_mut().counter = 42;
        source.state_mut().note = "moved".into();

        let store = source
            .handle(&Envelope::parse("dst=a1&tag=travel!").unwrap())
            .unwrap()
            .remove(0);

        // The scout re-addresses the blob and delivers it as settle!
        let mut settle = store.clone();
        settle.set("dst", "a1");
        settle.remove("agent");
        settle.remove("tag");
        settle.push("tag", "settle!");

        let mut fresh = TravelerAgent::new("a1");
        let out = fresh.handle(&settle).unwrap();

        assert_eq!(fresh.state().counter, 42);
        assert_eq!(fresh.state().note, "moved");
        assert!(!fresh.is_travelling());
        assert!(out[0].has_tag("retrieve-msg"));
    }

    #[test]
    fn messages_received_mid_move_are_deferred() {
        let mut agent = TravelerAgent::new("a1");
        agent
            .handle(&Envelope::parse("dst=a1&tag=travel!").unwrap())
            .unwrap();

        let incoming = Envelope::parse("dst=a1&src=mail&tag=new-mail&subject=hi").unwrap();
        let out = agent.handle(&incoming).unwrap();

        assert_eq!(out[0].dst(), Some("scout"));
        assert!(out[0].has_tag("store-msg"));
        assert_eq!(out[0].get("_outpost_dst"), Some("a1"));
        assert_eq!(out[0].get("_outpost_src"), Some("mail"));
        assert_eq!(out[0].get("_outpost_tag"), Some("new-mail"));
    }

    #[test]
    fn snapshot_roundtrips_through_the_wire_encoding() {
        let mut agent = TravelerAgent::new("a1");
        agent.state_mut().counter = 9000;

        let blob = serial::serialize(&agent.snapshot().unwrap());
        let mut other = TravelerAgent::new("a1");
        other
            .restore(&serial::deserialize(&blob).unwrap())
            .unwrap();

        assert_eq!(other.state(), agent.state());
    }
}
