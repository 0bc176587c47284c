//! Fan-out of administrative requests across the configured managers.
//!
//! The router is the handler a server role usually runs. For each request
//! it walks the configured managers in order, calls the ones that implement
//! the operation and pass the request's `managers` filter, journals every
//! per-manager result, lets reactions respond to each, and folds the pieces
//! into one aggregate result: the sum of the statuses plus a mapping from
//! manager name to wire-form result.
//!
//! Managers are constructed and initialized once, up front. A hook that
//! cannot be built or initialized is not quietly dropped; the router refuses
//! to start with a reduced set.

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::actions;
use crate::activity::{ActivityStream, NullActivityStream};
use crate::config::{Config, NONE_SENTINEL};
use crate::dispatch::Handler;
use crate::manager::{AdminOp, Manager, Targets};
use crate::reactions::{DefaultReactions, Reactions};
use crate::registry::Registry;
use crate::result::{status, CallResult};

/// Response sent back when the read-only gate refuses a write.
pub const READ_ONLY_MESSAGE: &str =
    "Read-only operation is enabled, but write operation requested";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{initialized} of {configured} hooks initialized; refusing to run with a reduced set")]
    ReducedManagerSet { initialized: usize, configured: usize },
}

pub struct Router {
    managers: Vec<Box<dyn Manager>>,
    journal: Box<dyn ActivityStream>,
    reactions: Box<dyn Reactions>,
    read_only: bool,
}

impl Router {
    /// Builds the router for a role: journal, reactions, and every manager
    /// listed in `HOOKS`, initialized in order.
    pub async fn from_config(config: &Config, registry: &Registry) -> anyhow::Result<Self> {
        for (key, value) in config.iter() {
            if key == crate::config::keys::MQPASS {
                debug!("{} = ***", key);
            } else {
                debug!("{} = {:?}", key, value);
            }
        }

        let journal: Box<dyn ActivityStream> = match config.activity_stream_class().as_str() {
            NONE_SENTINEL => {
                info!("not recording an activity stream");
                Box::new(NullActivityStream)
            }
            key => {
                info!(key, "recording activity");
                registry.journal(key, config).await?
            }
        };

        let reactions: Box<dyn Reactions> = match config.reaction_handler() {
            Some(key) => registry.reactions(&key, config).await?,
            None => {
                info!("no reaction handler configured, using the default");
                Box::new(DefaultReactions::from_config(config))
            }
        };

        let hooks = config.hooks()?;
        let mut managers: Vec<Box<dyn Manager>> = Vec::with_capacity(hooks.len());
        for hook in &hooks {
            let mut manager = match registry.manager(hook, config).await {
                Ok(manager) => manager,
                Err(err) => {
                    error!(hook, "could not construct hook: {:#}", err);
                    continue;
                }
            };
            match manager.initialize().await {
                Ok(()) => {
                    info!(hook, "loaded manager");
                    managers.push(manager);
                }
                Err(err) => {
                    error!(hook, "hook failed to initialize: {:#}", err);
                }
            }
        }
        if managers.len() < hooks.len() {
            return Err(RouterError::ReducedManagerSet {
                initialized: managers.len(),
                configured: hooks.len(),
            }
            .into());
        }

        Ok(Self {
            managers,
            journal,
            reactions,
            read_only: config.read_only_enabled(),
        })
    }

    /// Assembles a router from already-built parts. Managers must already be
    /// initialized.
    pub fn with_parts(
        managers: Vec<Box<dyn Manager>>,
        journal: Box<dyn ActivityStream>,
        reactions: Box<dyn Reactions>,
        read_only: bool,
    ) -> Self {
        Self { managers, journal, reactions, read_only }
    }

    /// Finalizes every manager, in order. Called on shutdown.
    pub async fn finalize_managers(&mut self) {
        for manager in &mut self.managers {
            manager.finalize().await;
        }
    }

    /// Runs one operation across the managers selected by `targets`.
    async fn safe_call(&mut self, op: &AdminOp, targets: &Targets) -> anyhow::Result<CallResult> {
        let method = op.name();
        let args = op.args();

        if self.read_only && actions::is_write_action(method) {
            let result = CallResult::error(status::DELIVERY_FAILED, READ_ONLY_MESSAGE);
            self.journal.record(&format!("{method}:any"), &args, &result).await;
            return Ok(result);
        }

        let mut aggregate_status = 0i64;
        let mut all_results = Mapping::new();
        let mut priors: u32 = 0;
        for manager in &mut self.managers {
            let name = manager.name();
            if !targets.selects(name) {
                continue;
            }
            let Some(outcome) = manager.apply(op).await else {
                debug!(method, manager = name, "operation not implemented, skipping");
                continue;
            };
            // A manager that errors out (rather than reporting a non-zero
            // status) aborts the fan-out; the dispatcher turns the error
            // into an internal-error envelope.
            let result = outcome?;
            aggregate_status += result.status;
            all_results.insert(Value::String(name.to_owned()), result.to_wire());
            self.journal.record(&format!("{method}:{name}"), &args, &result).await;
            priors += self
                .reactions
                .occur_in_response_to(name, method, &args, &result, priors)
                .await;
        }
        Ok(CallResult::new(aggregate_status, Value::Mapping(all_results)))
    }

    pub async fn add_group(&mut self, group_atts: Mapping, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::AddGroup { group_atts }, targets).await
    }

    pub async fn get_group(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::GetGroup { name }, targets).await
    }

    pub async fn list_groups(&mut self, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::ListGroups, targets).await
    }

    pub async fn get_members(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::GetMembers { name }, targets).await
    }

    pub async fn update_group(&mut self, group_atts: Mapping, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::UpdateGroup { group_atts }, targets).await
    }

    pub async fn delete_group(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::DeleteGroup { name }, targets).await
    }

    pub async fn exists_group(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::ExistsGroup { name }, targets).await
    }

    pub async fn add_user(&mut self, user_atts: Mapping, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::AddUser { user_atts }, targets).await
    }

    pub async fn update_user(&mut self, user_atts: Mapping, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::UpdateUser { user_atts }, targets).await
    }

    pub async fn get_user(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::GetUser { name }, targets).await
    }

    pub async fn list_users(&mut self, with_default_group: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::ListUsers { with_default_group }, targets).await
    }

    pub async fn validate_users(&mut self, names: Vec<String>, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::ValidateUsers { names }, targets).await
    }

    pub async fn roles_user(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::RolesUser { name }, targets).await
    }

    pub async fn delete_user(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::DeleteUser { name }, targets).await
    }

    pub async fn exists_user(&mut self, name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::ExistsUser { name }, targets).await
    }

    pub async fn set_user_default_group(&mut self, user_name: String, group_name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::SetUserDefaultGroup { user_name, group_name }, targets).await
    }

    pub async fn associate_user_to_group(&mut self, user_name: String, group_name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::AssociateUserToGroup { user_name, group_name }, targets).await
    }

    pub async fn disassociate_user_from_group(&mut self, user_name: String, group_name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::DisassociateUserFromGroup { user_name, group_name }, targets).await
    }

    pub async fn disassociate_users_from_group(&mut self, user_names: Vec<String>, group_name: String, targets: &Targets) -> anyhow::Result<CallResult> {
        self.safe_call(&AdminOp::DisassociateUsersFromGroup { user_names, group_name }, targets).await
    }
}

#[async_trait]
impl Handler for Router {
    fn action_params(&self, action: &str) -> Option<&'static [&'static str]> {
        actions::schema(action).map(|schema| schema.params)
    }

    async fn handle(&mut self, action: &str, envelope: &Mapping) -> anyhow::Result<CallResult> {
        let targets = match Targets::from_envelope(envelope.get(actions::MANAGERS_KEY)) {
            Ok(targets) => targets,
            Err(err) => {
                warn!(action, "bad managers filter: {}", err);
                return Ok(CallResult::error(status::MALFORMED_ENVELOPE, &err.to_string()));
            }
        };
        let op = match AdminOp::from_envelope(action, envelope) {
            Ok(Some(op)) => op,
            Ok(None) => {
                // The dispatcher screens unknown actions; reaching this arm
                // means the schema and the op table disagree.
                error!(action, "action is in the schema but has no operation");
                return Ok(CallResult::new(status::UNKNOWN_ACTION, Value::Null));
            }
            Err(err) => {
                warn!(action, "bad envelope: {}", err);
                return Ok(CallResult::error(status::MALFORMED_ENVELOPE, &err.to_string()));
            }
        };
        self.safe_call(&op, &targets).await
    }

    /// Managers were initialized during construction; nothing left to do.
    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) {
        self.finalize_managers().await;
    }
}
