//! Maps decoded request envelopes onto handler actions.
//!
//! The dispatcher consults the handler's action table (action name to
//! ordered parameter names), validates the envelope against it, and invokes
//! the handler. Every failure mode resolves to a result envelope with a
//! reserved status; nothing is re-raised toward the transport. The
//! dispatcher keeps no state between calls.

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{debug, error};

use crate::actions::ACTION_KEY;
use crate::result::{status, CallResult};

/// A server-side request handler: the target of dispatched envelopes.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Ordered parameter names of `action`, or `None` when the handler has
    /// no such action.
    fn action_params(&self, action: &str) -> Option<&'static [&'static str]>;

    /// Runs `action` against the full envelope. Every declared parameter is
    /// guaranteed present; extra keys may be there and are the handler's to
    /// ignore or use (the router reads its `managers` filter this way).
    async fn handle(&mut self, action: &str, envelope: &Mapping) -> anyhow::Result<CallResult>;

    /// Called once before the handler receives traffic.
    async fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once on shutdown. Must not fail.
    async fn finalize(&mut self) {}
}

/// Stateless envelope-to-action dispatcher.
pub struct Dispatcher;

impl Dispatcher {
    /// Dispatches one decoded message against `handler`.
    pub async fn dispatch(handler: &mut dyn Handler, message: &Value) -> CallResult {
        let Some(envelope) = message.as_mapping() else {
            error!("request is not a mapping: {message:?}");
            return CallResult::new(status::MALFORMED_ENVELOPE, Value::Null);
        };
        let Some(action) = envelope.get(ACTION_KEY).and_then(Value::as_str) else {
            error!("request does not name an action: {envelope:?}");
            return CallResult::new(status::MALFORMED_ENVELOPE, Value::Null);
        };
        let Some(params) = handler.action_params(action) else {
            error!(action, "no such action on the configured handler");
            return CallResult::new(status::UNKNOWN_ACTION, Value::Null);
        };
        for param in params {
            if !envelope.contains_key(*param) {
                error!(action, param, "request is missing a declared parameter");
                return CallResult::new(status::MISSING_PARAMETER, Value::Null);
            }
        }
        match handler.handle(action, envelope).await {
            Ok(result) => {
                debug!(action, result.status, "action handled");
                result
            }
            Err(err) => {
                error!(action, "handler failed: {:#}", err);
                CallResult::new(status::HANDLER_FAILED, Value::Null)
            }
        }
    }
}
