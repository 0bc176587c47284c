//! Post-action side effects.
//!
//! After every per-manager result the router gives the reactions component a
//! chance to respond: notify an operator, open a ticket, whatever the
//! deployment wires in. Reactions see how many reactions earlier managers in
//! the same request already fired, so they can throttle themselves. They
//! must not mutate the result and must not block the router beyond a bounded
//! time.

use async_trait::async_trait;
use serde_yaml::Value;
use tracing::warn;

use crate::codec;
use crate::config::Config;
use crate::result::CallResult;

/// Reacts to a single manager's result. Returns how many reactions fired.
#[async_trait]
pub trait Reactions: Send + Sync {
    async fn occur_in_response_to(
        &self,
        class_name: &str,
        action: &str,
        payload: &Value,
        result: &CallResult,
        prior_count: u32,
    ) -> u32;
}

/// Delivery channel for operator notifications. Actual delivery (SMTP or
/// otherwise) lives outside the core; the default sink writes to the log.
pub trait Notifier: Send + Sync {
    /// Delivers one notification. Returns false when delivery was not
    /// possible; the failure must not propagate.
    fn notify(&self, recipient: &str, subject: &str, body: &str) -> bool;
}

/// Notifier that records the message in the process log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient: &str, subject: &str, body: &str) -> bool {
        warn!(recipient, subject, "{}", body);
        true
    }
}

/// Default reactions: one operator notification per failed result.
pub struct DefaultReactions {
    notifier: Box<dyn Notifier>,
    recipient: Option<String>,
}

impl DefaultReactions {
    pub fn new(notifier: Box<dyn Notifier>, recipient: Option<String>) -> Self {
        Self { notifier, recipient }
    }

    /// Builds the default reactions from the role configuration, delivering
    /// through the log.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Box::new(LogNotifier), config.reaction_notify())
    }
}

#[async_trait]
impl Reactions for DefaultReactions {
    async fn occur_in_response_to(
        &self,
        class_name: &str,
        action: &str,
        payload: &Value,
        result: &CallResult,
        _prior_count: u32,
    ) -> u32 {
        if result.is_success() {
            return 0;
        }
        let Some(recipient) = self.recipient.as_deref() else {
            warn!(
                class_name,
                action, "operation failed but no notification recipient is configured"
            );
            return 0;
        };
        let payload_text = codec::encode(payload).unwrap_or_else(|_| format!("{payload:?}"));
        let response_text =
            codec::encode(&result.response).unwrap_or_else(|_| format!("{:?}", result.response));
        let body = format!(
            "class: {class_name}\naction: {action}\npayload: {payload_text}\nstatus: {}\nresponse: {response_text}",
            result.status
        );
        u32::from(self.notifier.notify(recipient, "administration operation failed", &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingNotifier(Arc<AtomicU32>);

    impl Notifier for CountingNotifier {
        fn notify(&self, _recipient: &str, _subject: &str, _body: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn success_fires_nothing() {
        let count = Arc::new(AtomicU32::new(0));
        let reactions = DefaultReactions::new(
            Box::new(CountingNotifier(count.clone())),
            Some("ops@example.org".into()),
        );
        let fired = reactions
            .occur_in_response_to("M", "add_group", &Value::Null, &CallResult::ok(Value::Null), 0)
            .await;
        assert_eq!(fired, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_fires_exactly_one_notification() {
        let count = Arc::new(AtomicU32::new(0));
        let reactions = DefaultReactions::new(
            Box::new(CountingNotifier(count.clone())),
            Some("ops@example.org".into()),
        );
        let fired = reactions
            .occur_in_response_to(
                "M",
                "add_group",
                &Value::Null,
                &CallResult::error(7, "backend said no"),
                0,
            )
            .await;
        assert_eq!(fired, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_recipient_counts_as_not_fired() {
        let count = Arc::new(AtomicU32::new(0));
        let reactions = DefaultReactions::new(Box::new(CountingNotifier(count.clone())), None);
        let fired = reactions
            .occur_in_response_to("M", "add_group", &Value::Null, &CallResult::error(7, "x"), 0)
            .await;
        assert_eq!(fired, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
