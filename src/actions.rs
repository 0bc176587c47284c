//! The frozen action schema shared by clients and servers.
//!
//! The wire contract couples the two sides through parameter names: an
//! envelope's keys must match the declared parameter list of the action it
//! names. Both the client facades and the router's dispatch table consume
//! this single definition so they cannot drift apart.

/// Envelope key selecting which managers a router request targets.
pub const MANAGERS_KEY: &str = "managers";

/// Envelope key naming the requested action.
pub const ACTION_KEY: &str = "action";

/// One administrative action: its wire name and ordered parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSchema {
    pub name: &'static str,
    pub params: &'static [&'static str],
}

/// Every action the bus carries, in a stable order.
pub const ACTIONS: &[ActionSchema] = &[
    ActionSchema { name: "add_group", params: &["group_atts"] },
    ActionSchema { name: "get_group", params: &["name"] },
    ActionSchema { name: "list_groups", params: &[] },
    ActionSchema { name: "get_members", params: &["name"] },
    ActionSchema { name: "update_group", params: &["group_atts"] },
    ActionSchema { name: "delete_group", params: &["name"] },
    ActionSchema { name: "exists_group", params: &["name"] },
    ActionSchema { name: "add_user", params: &["user_atts"] },
    ActionSchema { name: "update_user", params: &["user_atts"] },
    ActionSchema { name: "get_user", params: &["name"] },
    ActionSchema { name: "list_users", params: &["with_default_group"] },
    ActionSchema { name: "validate_users", params: &["names"] },
    ActionSchema { name: "roles_user", params: &["name"] },
    ActionSchema { name: "delete_user", params: &["name"] },
    ActionSchema { name: "exists_user", params: &["name"] },
    ActionSchema { name: "set_user_default_group", params: &["user_name", "group_name"] },
    ActionSchema { name: "associate_user_to_group", params: &["user_name", "group_name"] },
    ActionSchema { name: "disassociate_user_from_group", params: &["user_name", "group_name"] },
    ActionSchema { name: "disassociate_users_from_group", params: &["user_names", "group_name"] },
];

/// Looks up the schema entry for `action`.
pub fn schema(action: &str) -> Option<&'static ActionSchema> {
    ACTIONS.iter().find(|entry| entry.name == action)
}

/// Substrings that mark an action as a write. The match is deliberately a
/// substring test, so e.g. `disassociate_user_from_group` is caught by
/// `associate`. An action named `reset_cache` would also be caught by `set`;
/// new action names must be chosen with this rule in mind.
pub const WRITE_MARKERS: &[&str] = &["add", "delete", "associate", "update", "set"];

/// True when `action` mutates backend state under the read-only gate's rule.
pub fn is_write_action(action: &str) -> bool {
    WRITE_MARKERS.iter().any(|marker| action.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_resolves() {
        for entry in ACTIONS {
            assert_eq!(schema(entry.name).map(|s| s.name), Some(entry.name));
        }
        assert!(schema("no_such_action").is_none());
    }

    #[test]
    fn write_marking_is_substring_based() {
        assert!(is_write_action("add_group"));
        assert!(is_write_action("disassociate_user_from_group"));
        assert!(is_write_action("set_user_default_group"));
        assert!(!is_write_action("list_groups"));
        assert!(!is_write_action("exists_user"));
        assert!(!is_write_action("roles_user"));
    }

    #[test]
    fn action_names_are_unique() {
        for (i, a) in ACTIONS.iter().enumerate() {
            for b in &ACTIONS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
