//! Bus message envelopes
//!
//! A message on the Hive bus is a single text line of `key=value` pairs
//! joined by `&`. A repeated key (most commonly `tag`) carries a list.
//! Pair order is preserved so that a message can be stored and re-emitted
//! byte-for-byte, which the deferred-message machinery relies on.

use thiserror::Error;

/// Tag used on messages deferred while an agent is travelling.
pub const TAG_STORE_MSG: &str = "store-msg";

/// Destination of every deferred or captured-state message.
pub const SCOUT_NAME: &str = "scout";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("empty message")]
    Empty,
    #[error("malformed pair (no '='): {0}")]
    MalformedPair(String),
}

/// An ordered multimap of envelope fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pairs: Vec<(String, String)>,
}

impl Envelope {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Build an envelope from literal pairs, keeping their order.
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self {
            pairs: pairs
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
                .collect(),
        }
    }

    /// Parse a wire message into an envelope.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        let mut pairs = Vec::new();
        for chunk in raw.split('&') {
            match chunk.split_once('=') {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => return Err(EnvelopeError::MalformedPair(chunk.to_string())),
            }
        }

        Ok(Self { pairs })
    }

    /// Render the envelope back to its wire form.
    pub fn to_wire(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// First value for a key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a key, in order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn dst(&self) -> Option<&str> {
        self.get("dst")
    }

    pub fn tags(&self) -> Vec<&str> {
        self.get_all("tag")
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| *t == tag)
    }

    /// Replace the first value for a key, or append the pair if absent.
    /// Extra duplicates of the key are left untouched.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    /// Append a pair, allowing duplicate keys.
    pub fn push(&mut self, key: &str, value: &str) {
        self.pairs.push((key.to_string(), value.to_string()));
    }

    /// Remove every pair with the given key.
    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    /// Remove the exact (key, value) pair wherever it appears.
    pub fn remove_pair(&mut self, key: &str, value: &str) {
        self.pairs.retain(|(k, v)| !(k == key && v == value));
    }

    /// Rename every occurrence of a key in place, keeping positions.
    pub fn rename(&mut self, from: &str, to: &str) {
        for (k, _) in self.pairs.iter_mut() {
            if k == from {
                *k = to.to_string();
            }
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Rewrite a message addressed to a travelling agent so the scout can store
/// it: the original `dst`/`src`/`tag` fields move to their `_outpost_*`
/// counterparts in place, and the message is re-addressed to the scout with
/// the `store-msg` tag.
pub fn defer_rewrite(msg: &Envelope) -> Envelope {
    let mut out = msg.clone();

    out.rename("dst", "_outpost_dst");
    out.rename("src", "_outpost_src");
    out.rename("tag", "_outpost_tag");

    out.push("dst", SCOUT_NAME);
    out.push("tag", TAG_STORE_MSG);
    out
}

/// Restore the original envelope of a deferred message. Inverse of
/// [`defer_rewrite`]: strips the scout addressing and moves the `_outpost_*`
/// fields back in place.
pub fn defer_restore(msg: &Envelope) -> Envelope {
    let mut out = msg.clone();

    out.remove_pair("dst", SCOUT_NAME);
    out.remove_pair("tag", TAG_STORE_MSG);

    out.rename("_outpost_dst", "dst");
    out.rename("_outpost_src", "src");
    out.rename("_outpost_tag", "tag");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_roundtrip() {
        let raw = "dst=scout&tag=migrate-agent&agent=a1&outpost_id=o1";
        let msg = Envelope::parse(raw).unwrap();

        assert_eq!(msg.dst(), Some("scout"));
        assert_eq!(msg.get("agent"), Some("a1"));
        assert_eq!(msg.to_wire(), raw);
    }

    #[test]
    fn repeated_keys_become_lists() {
        let msg = Envelope::parse("dst=o1&paths=a/b&paths=c/d&action=clean").unwrap();
        assert_eq!(msg.get_all("paths"), vec!["a/b", "c/d"]);
    }

    #[test]
    fn multiple_tags() {
        let msg = Envelope::parse("dst=a1&tag=settle!&tag=extra").unwrap();
        assert!(msg.has_tag("settle!"));
        assert!(msg.has_tag("extra"));
        assert!(!msg.has_tag("travel!"));
    }

    #[test]
    fn malformed_pair_is_rejected() {
        assert_eq!(
            Envelope::parse("dst=scout&oops"),
            Err(EnvelopeError::MalformedPair("oops".into()))
        );
        assert_eq!(Envelope::parse(""), Err(EnvelopeError::Empty));
    }

    #[test]
    fn set_replaces_first_value_only() {
        let mut msg = Envelope::parse("dst=scout&agent=a1").unwrap();
        msg.set("dst", "a1");
        msg.set("port", "30101");

        assert_eq!(msg.to_wire(), "dst=a1&agent=a1&port=30101");
    }

    #[test]
    fn defer_rewrite_targets_the_scout() {
        let msg = Envelope::parse("dst=a1&src=mail&tag=ping&body=hello").unwrap();
        let deferred = defer_rewrite(&msg);

        assert_eq!(deferred.dst(), Some(SCOUT_NAME));
        assert!(deferred.has_tag(TAG_STORE_MSG));
        assert_eq!(deferred.get("_outpost_dst"), Some("a1"));
        assert_eq!(deferred.get("_outpost_src"), Some("mail"));
        assert_eq!(deferred.get("_outpost_tag"), Some("ping"));
    }

    #[test]
    fn defer_roundtrip_restores_the_exact_envelope() {
        for raw in [
            "dst=a1&src=mail&tag=ping&body=hello",
            "dst=a1&body=no-src-no-tag",
            "dst=a1&tag=one&tag=two&src=relay",
        ] {
            let msg = Envelope::parse(raw).unwrap();
            assert_eq!(defer_restore(&defer_rewrite(&msg)), msg);
            assert_eq!(defer_restore(&defer_rewrite(&msg)).to_wire(), raw);
        }
    }
}
