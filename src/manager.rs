//! The backend manager contract and the operations carried to managers.
//!
//! A manager wraps one external system (a job scheduler, a directory
//! service) behind the administrative operations it chooses to support.
//! Lifecycle is explicit: `initialize` before any traffic, `finalize` on
//! shutdown, both unconditional parts of the trait so no plug-in can ship
//! without them.

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::actions;
use crate::result::CallResult;

/// A single administrative operation with its typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminOp {
    AddGroup { group_atts: Mapping },
    GetGroup { name: String },
    ListGroups,
    GetMembers { name: String },
    UpdateGroup { group_atts: Mapping },
    DeleteGroup { name: String },
    ExistsGroup { name: String },
    AddUser { user_atts: Mapping },
    UpdateUser { user_atts: Mapping },
    GetUser { name: String },
    ListUsers { with_default_group: String },
    ValidateUsers { names: Vec<String> },
    RolesUser { name: String },
    DeleteUser { name: String },
    ExistsUser { name: String },
    SetUserDefaultGroup { user_name: String, group_name: String },
    AssociateUserToGroup { user_name: String, group_name: String },
    DisassociateUserFromGroup { user_name: String, group_name: String },
    DisassociateUsersFromGroup { user_names: Vec<String>, group_name: String },
}

/// A request envelope value that names a known action but carries a
/// parameter of the wrong shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parameter {key} of {action} is not {expected}")]
pub struct EnvelopeError {
    pub action: &'static str,
    pub key: &'static str,
    pub expected: &'static str,
}

impl AdminOp {
    /// The wire name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddGroup { .. } => "add_group",
            Self::GetGroup { .. } => "get_group",
            Self::ListGroups => "list_groups",
            Self::GetMembers { .. } => "get_members",
            Self::UpdateGroup { .. } => "update_group",
            Self::DeleteGroup { .. } => "delete_group",
            Self::ExistsGroup { .. } => "exists_group",
            Self::AddUser { .. } => "add_user",
            Self::UpdateUser { .. } => "update_user",
            Self::GetUser { .. } => "get_user",
            Self::ListUsers { .. } => "list_users",
            Self::ValidateUsers { .. } => "validate_users",
            Self::RolesUser { .. } => "roles_user",
            Self::DeleteUser { .. } => "delete_user",
            Self::ExistsUser { .. } => "exists_user",
            Self::SetUserDefaultGroup { .. } => "set_user_default_group",
            Self::AssociateUserToGroup { .. } => "associate_user_to_group",
            Self::DisassociateUserFromGroup { .. } => "disassociate_user_from_group",
            Self::DisassociateUsersFromGroup { .. } => "disassociate_users_from_group",
        }
    }

    /// The ordered argument list, as journaled and handed to reactions.
    pub fn args(&self) -> Value {
        let items: Vec<Value> = match self {
            Self::AddGroup { group_atts } | Self::UpdateGroup { group_atts } => {
                vec![Value::Mapping(group_atts.clone())]
            }
            Self::AddUser { user_atts } | Self::UpdateUser { user_atts } => {
                vec![Value::Mapping(user_atts.clone())]
            }
            Self::GetGroup { name }
            | Self::GetMembers { name }
            | Self::DeleteGroup { name }
            | Self::ExistsGroup { name }
            | Self::GetUser { name }
            | Self::RolesUser { name }
            | Self::DeleteUser { name }
            | Self::ExistsUser { name } => vec![Value::String(name.clone())],
            Self::ListGroups => vec![],
            Self::ListUsers { with_default_group } => {
                vec![Value::String(with_default_group.clone())]
            }
            Self::ValidateUsers { names } => vec![string_list(names)],
            Self::SetUserDefaultGroup { user_name, group_name }
            | Self::AssociateUserToGroup { user_name, group_name }
            | Self::DisassociateUserFromGroup { user_name, group_name } => vec![
                Value::String(user_name.clone()),
                Value::String(group_name.clone()),
            ],
            Self::DisassociateUsersFromGroup { user_names, group_name } => {
                vec![string_list(user_names), Value::String(group_name.clone())]
            }
        };
        Value::Sequence(items)
    }

    /// Builds the operation from a validated envelope. The dispatcher has
    /// already checked that every declared parameter is present; this only
    /// converts shapes.
    pub fn from_envelope(action: &str, envelope: &Mapping) -> Result<Option<Self>, EnvelopeError> {
        let Some(schema) = actions::schema(action) else {
            return Ok(None);
        };
        let op = match schema.name {
            "add_group" => Self::AddGroup {
                group_atts: mapping_field(schema.name, envelope, "group_atts")?,
            },
            "get_group" => Self::GetGroup {
                name: string_field(schema.name, envelope, "name")?,
            },
            "list_groups" => Self::ListGroups,
            "get_members" => Self::GetMembers {
                name: string_field(schema.name, envelope, "name")?,
            },
            "update_group" => Self::UpdateGroup {
                group_atts: mapping_field(schema.name, envelope, "group_atts")?,
            },
            "delete_group" => Self::DeleteGroup {
                name: string_field(schema.name, envelope, "name")?,
            },
            "exists_group" => Self::ExistsGroup {
                name: string_field(schema.name, envelope, "name")?,
            },
            "add_user" => Self::AddUser {
                user_atts: mapping_field(schema.name, envelope, "user_atts")?,
            },
            "update_user" => Self::UpdateUser {
                user_atts: mapping_field(schema.name, envelope, "user_atts")?,
            },
            "get_user" => Self::GetUser {
                name: string_field(schema.name, envelope, "name")?,
            },
            "list_users" => Self::ListUsers {
                with_default_group: string_field(schema.name, envelope, "with_default_group")?,
            },
            "validate_users" => Self::ValidateUsers {
                names: string_list_field(schema.name, envelope, "names")?,
            },
            "roles_user" => Self::RolesUser {
                name: string_field(schema.name, envelope, "name")?,
            },
            "delete_user" => Self::DeleteUser {
                name: string_field(schema.name, envelope, "name")?,
            },
            "exists_user" => Self::ExistsUser {
                name: string_field(schema.name, envelope, "name")?,
            },
            "set_user_default_group" => Self::SetUserDefaultGroup {
                user_name: string_field(schema.name, envelope, "user_name")?,
                group_name: string_field(schema.name, envelope, "group_name")?,
            },
            "associate_user_to_group" => Self::AssociateUserToGroup {
                user_name: string_field(schema.name, envelope, "user_name")?,
                group_name: string_field(schema.name, envelope, "group_name")?,
            },
            "disassociate_user_from_group" => Self::DisassociateUserFromGroup {
                user_name: string_field(schema.name, envelope, "user_name")?,
                group_name: string_field(schema.name, envelope, "group_name")?,
            },
            "disassociate_users_from_group" => Self::DisassociateUsersFromGroup {
                user_names: string_list_field(schema.name, envelope, "user_names")?,
                group_name: string_field(schema.name, envelope, "group_name")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(op))
    }
}

fn string_list(items: &[String]) -> Value {
    Value::Sequence(items.iter().cloned().map(Value::String).collect())
}

fn string_field(
    action: &'static str,
    envelope: &Mapping,
    key: &'static str,
) -> Result<String, EnvelopeError> {
    envelope
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(EnvelopeError { action, key, expected: "a string" })
}

fn mapping_field(
    action: &'static str,
    envelope: &Mapping,
    key: &'static str,
) -> Result<Mapping, EnvelopeError> {
    envelope
        .get(key)
        .and_then(Value::as_mapping)
        .cloned()
        .ok_or(EnvelopeError { action, key, expected: "a mapping" })
}

fn string_list_field(
    action: &'static str,
    envelope: &Mapping,
    key: &'static str,
) -> Result<Vec<String>, EnvelopeError> {
    let err = EnvelopeError { action, key, expected: "a list of strings" };
    envelope
        .get(key)
        .and_then(Value::as_sequence)
        .ok_or(err.clone())?
        .iter()
        .map(|item| item.as_str().map(str::to_owned).ok_or(err.clone()))
        .collect()
}

/// Which managers a request targets: everything, or a named subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Any,
    Named(Vec<String>),
}

impl Targets {
    /// True when the manager called `name` should receive the call.
    pub fn selects(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Named(names) => names.iter().any(|n| n == name),
        }
    }

    /// Reads the `managers` envelope value. Absent or `"any"` targets every
    /// manager; a lone name or a list of names targets a subset.
    pub fn from_envelope(value: Option<&Value>) -> Result<Self, EnvelopeError> {
        let err = EnvelopeError {
            action: "request",
            key: actions::MANAGERS_KEY,
            expected: "\"any\" or a list of manager names",
        };
        match value {
            None | Some(Value::Null) => Ok(Self::Any),
            Some(Value::String(s)) if s == "any" => Ok(Self::Any),
            Some(Value::String(s)) => Ok(Self::Named(vec![s.clone()])),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_owned).ok_or(err.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Named),
            Some(_) => Err(err),
        }
    }

    /// The envelope value a client writes for this filter.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Any => Value::String("any".to_owned()),
            Self::Named(names) => {
                Value::Sequence(names.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

/// One backend plug-in.
///
/// `apply` returns `None` for operations the manager does not implement;
/// the router skips it silently. `Some(Err(_))` means the backend blew up
/// mid-operation and is converted to an internal-error envelope upstream;
/// domain failures are `Some(Ok(result))` with a non-zero status.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Stable name used for filtering and in aggregated responses.
    fn name(&self) -> &'static str;

    /// Called once before the manager receives traffic.
    async fn initialize(&mut self) -> anyhow::Result<()>;

    /// Called once on shutdown. Must not fail.
    async fn finalize(&mut self);

    /// Executes `op` against the backend, or `None` when unsupported.
    async fn apply(&mut self, op: &AdminOp) -> Option<anyhow::Result<CallResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builds_ops_from_envelopes() {
        let map = envelope("{action: add_group, group_atts: {name: g1}}");
        let op = AdminOp::from_envelope("add_group", &map).unwrap().unwrap();
        assert_eq!(op.name(), "add_group");

        let map = envelope("{action: set_user_default_group, user_name: u, group_name: g}");
        let op = AdminOp::from_envelope("set_user_default_group", &map).unwrap().unwrap();
        assert_eq!(
            op,
            AdminOp::SetUserDefaultGroup {
                user_name: "u".into(),
                group_name: "g".into()
            }
        );
    }

    #[test]
    fn mistyped_parameter_is_rejected() {
        let map = envelope("{action: get_group, name: [not, a, string]}");
        let err = AdminOp::from_envelope("get_group", &map).unwrap_err();
        assert_eq!(err.key, "name");
    }

    #[test]
    fn unknown_action_builds_nothing() {
        let map = envelope("{action: make_coffee}");
        assert_eq!(AdminOp::from_envelope("make_coffee", &map), Ok(None));
    }

    #[test]
    fn args_preserve_declared_order() {
        let op = AdminOp::DisassociateUsersFromGroup {
            user_names: vec!["u1".into(), "u2".into()],
            group_name: "g".into(),
        };
        let args = op.args();
        let items = args.as_sequence().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_str(), Some("g"));
    }

    #[test]
    fn targets_filter() {
        assert!(Targets::Any.selects("Anything"));
        let named = Targets::Named(vec!["Handler2".into()]);
        assert!(named.selects("Handler2"));
        assert!(!named.selects("Handler1"));
    }

    #[test]
    fn targets_parse_from_envelope() {
        assert_eq!(Targets::from_envelope(None), Ok(Targets::Any));
        assert_eq!(
            Targets::from_envelope(Some(&Value::String("any".into()))),
            Ok(Targets::Any)
        );
        assert_eq!(
            Targets::from_envelope(Some(&Value::Sequence(vec![Value::String("H".into())]))),
            Ok(Targets::Named(vec!["H".into()]))
        );
        assert!(Targets::from_envelope(Some(&Value::Bool(true))).is_err());
    }
}
