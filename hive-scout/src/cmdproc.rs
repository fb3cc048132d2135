/**
 * COMMANDES OPÉRATEUR - Traduction texte -> messages bus
 *
 * RÔLE : Transforme une ligne de commande opérateur (`scout migrate a1 o1`)
 * en message étiqueté pour le scout. Une entrée non reconnue ne produit
 * aucune réponse ; `scout help` liste les commandes disponibles.
 */
use std::sync::OnceLock;

use regex::Regex;

/// Help lines printed as feedback for `scout help`.
pub const HELP_LINES: &[&str] = &[
    " Scout agent commands",
    "---------",
    "- scout backup <agent> -> force the creation of the backup directory for a given agent (can only be done if agent is in central)",
    "- scout close-tunnel <outpost> -> manually close the SSH tunnel to the specified outpost",
    "- scout hold <agent> -> hold an agent in its current location (can only be moved manually)",
    "- scout launch-outpost <outpost> -> manually launch a remote outpost",
    "- scout locations -> show current agent locations",
    "- scout migrate <agent> <outpost> -> migrate an agent to the given outpost",
    "- scout open-tunnel <outpost> -> manually open a SSH tunnel to the specified outpost",
    "- scout retrieve-info <agent> -> force information retrieval for an agent",
    "- scout retrieve-msg <agent> -> force message retrieval for an agent",
    "- scout status agents -> show current status of the agents",
    "- scout status outposts -> show current status of the outposts",
    "- scout stop-outpost <outpost> -> manually stop a remote outpost",
    "- scout unhold <agent> -> unhold an agent so that it may be moved automatically by the scout using the active load balance algorithm",
];

/// Base pattern advertised to the natural-language front end.
pub const BASE_CMD: &str = r"^scout ([a-z\-]+)(\s?)(.*)$";

/// Command grammar: pattern -> message template with `$0`/`$1` argument
/// placeholders.
const PATTERNS: &[(&str, &str)] = &[
    (
        r"^scout backup ([a-zA-Z0-9_]+)$",
        "message tag=make-backup&agent=$0",
    ),
    (
        r"^scout close-tunnel ([a-zA-Z0-9_]+)$",
        "message tag=close-tunnel&outpost_id=$0",
    ),
    (
        r"^scout hold ([a-zA-Z0-9_]+)$",
        "message tag=hold-agent&agent=$0",
    ),
    (
        r"^scout launch-outpost ([a-zA-Z0-9_]+)$",
        "message tag=launch-outpost&outpost_id=$0",
    ),
    (r"^scout locations$", "message tag=show-locations"),
    (
        r"^scout migrate ([a-zA-Z0-9_]+) ([a-zA-Z0-9_]+)$",
        "message tag=migrate-agent&agent=$0&outpost_id=$1",
    ),
    (
        r"^scout open-tunnel ([a-zA-Z0-9_]+)$",
        "message tag=open-tunnel&outpost_id=$0",
    ),
    (
        r"^scout retrieve-info ([a-zA-Z0-9_]+)$",
        "message tag=retrieve-info&agent=$0",
    ),
    (
        r"^scout retrieve-msg ([a-zA-Z0-9_]+)$",
        "message tag=retrieve-msg&agent=$0",
    ),
    (r"^scout status agents$", "message tag=show-agent-status"),
    (r"^scout status outposts$", "message tag=show-outpost-status"),
    (
        r"^scout stop-outpost ([a-zA-Z0-9_]+)$",
        "message tag=stop-outpost&outpost_id=$0",
    ),
    (
        r"^scout unhold ([a-zA-Z0-9_]+)$",
        "message tag=unhold-agent&agent=$0",
    ),
];

fn compiled() -> &'static Vec<(Regex, &'static str)> {
    static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|(pattern, template)| {
                (
                    Regex::new(pattern).expect("command pattern"),
                    *template,
                )
            })
            .collect()
    })
}

/// Translate an operator line into the bus message to emit, carrying the
/// sender identity for the permission check. Unmatched input yields
/// nothing.
pub fn translate(original: &str, sender: &str, src: &str) -> Option<String> {
    for (regex, template) in compiled() {
        let Some(captures) = regex.captures(original) else {
            continue;
        };

        let mut cmd = template.to_string();
        for (index, group) in captures.iter().skip(1).enumerate() {
            if let Some(group) = group {
                cmd = cmd.replace(&format!("${index}"), group.as_str());
            }
        }

        return Some(format!("{cmd}&dst=scout&sender={sender}&src={src}"));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_form_translates() {
        let cases = [
            ("scout backup a1", "message tag=make-backup&agent=a1"),
            (
                "scout close-tunnel o1",
                "message tag=close-tunnel&outpost_id=o1",
            ),
            ("scout hold a1", "message tag=hold-agent&agent=a1"),
            (
                "scout launch-outpost o1",
                "message tag=launch-outpost&outpost_id=o1",
            ),
            ("scout locations", "message tag=show-locations"),
            (
                "scout migrate a1 o1",
                "message tag=migrate-agent&agent=a1&outpost_id=o1",
            ),
            (
                "scout open-tunnel o1",
                "message tag=open-tunnel&outpost_id=o1",
            ),
            (
                "scout retrieve-info a1",
                "message tag=retrieve-info&agent=a1",
            ),
            ("scout retrieve-msg a1", "message tag=retrieve-msg&agent=a1"),
            ("scout status agents", "message tag=show-agent-status"),
            ("scout status outposts", "message tag=show-outpost-status"),
            (
                "scout stop-outpost o1",
                "message tag=stop-outpost&outpost_id=o1",
            ),
            ("scout unhold a1", "message tag=unhold-agent&agent=a1"),
        ];

        for (line, expected) in cases {
            let full = format!("{expected}&dst=scout&sender=boss&src=term");
            assert_eq!(translate(line, "boss", "term"), Some(full), "for {line}");
        }
    }

    #[test]
    fn unmatched_input_yields_nothing() {
        for line in [
            "scout",
            "scout migrate",
            "scout migrate a1",
            "scout migrate a1 o1 extra",
            "scout destroy everything",
            "weather in paris",
            "scout hold bad name",
        ] {
            assert_eq!(translate(line, "", ""), None, "for {line}");
        }
    }

    #[test]
    fn names_are_restricted_to_word_characters() {
        assert!(translate("scout hold a-1", "", "").is_none());
        assert!(translate("scout hold under_score9", "", "").is_some());
    }

    #[test]
    fn help_lists_every_command() {
        for command in [
            "backup", "close-tunnel", "hold", "launch-outpost", "locations", "migrate",
            "open-tunnel", "retrieve-info", "retrieve-msg", "status", "stop-outpost", "unhold",
        ] {
            assert!(
                HELP_LINES.iter().any(|l| l.contains(command)),
                "help is missing {command}"
            );
        }
    }
}
