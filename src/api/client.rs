//! Typed request builders and the two client facades.

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::actions::{ACTION_KEY, MANAGERS_KEY};
use crate::config::{Config, ConfigError};
use crate::manager::Targets;
use crate::result::CallResult;
use crate::transport::{Producer, RpcClient, TransportError};

/// What a facade needs from its underlying transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, payload: &Value) -> CallResult;
    async fn close(&mut self);
}

#[async_trait]
impl Transport for Producer {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Producer::connect(self).await
    }

    async fn send(&mut self, payload: &Value) -> CallResult {
        Producer::send(self, payload).await
    }

    async fn close(&mut self) {
        Producer::close(self).await;
    }
}

#[async_trait]
impl Transport for RpcClient {
    async fn connect(&mut self) -> Result<(), TransportError> {
        RpcClient::connect(self).await
    }

    async fn send(&mut self, payload: &Value) -> CallResult {
        RpcClient::send(self, payload).await
    }

    async fn close(&mut self) {
        RpcClient::close(self).await;
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{argument} must contain a key 'name'")]
    MissingName { argument: &'static str },
}

/// Builds the `{action, ...params, managers}` envelope for one request.
fn request(action: &str, params: Vec<(&str, Value)>, managers: &Targets) -> Value {
    let mut map = Mapping::new();
    map.insert(
        Value::String(ACTION_KEY.to_owned()),
        Value::String(action.to_owned()),
    );
    for (key, value) in params {
        map.insert(Value::String(key.to_owned()), value);
    }
    map.insert(Value::String(MANAGERS_KEY.to_owned()), managers.to_value());
    Value::Mapping(map)
}

/// Checks the one structural precondition the facades enforce: attribute
/// mappings must name their subject.
fn require_name(argument: &'static str, atts: &Mapping) -> Result<(), ClientError> {
    if atts.contains_key("name") {
        Ok(())
    } else {
        Err(ClientError::MissingName { argument })
    }
}

fn strings(items: Vec<String>) -> Value {
    Value::Sequence(items.into_iter().map(Value::String).collect())
}

macro_rules! facade_common {
    () => {
        /// Connects the underlying transport.
        pub async fn initialize(&mut self) -> Result<(), TransportError> {
            self.transport.connect().await
        }

        /// Disconnects the underlying transport.
        pub async fn finalize(&mut self) {
            self.transport.close().await;
        }

        pub async fn add_group(
            &mut self,
            group_atts: Mapping,
            managers: &Targets,
        ) -> Result<CallResult, ClientError> {
            require_name("group_atts", &group_atts)?;
            let payload = request(
                "add_group",
                vec![("group_atts", Value::Mapping(group_atts))],
                managers,
            );
            Ok(self.transport.send(&payload).await)
        }

        pub async fn update_group(
            &mut self,
            group_atts: Mapping,
            managers: &Targets,
        ) -> Result<CallResult, ClientError> {
            require_name("group_atts", &group_atts)?;
            let payload = request(
                "update_group",
                vec![("group_atts", Value::Mapping(group_atts))],
                managers,
            );
            Ok(self.transport.send(&payload).await)
        }

        pub async fn delete_group(&mut self, name: String, managers: &Targets) -> CallResult {
            let payload = request("delete_group", vec![("name", Value::String(name))], managers);
            self.transport.send(&payload).await
        }

        pub async fn add_user(
            &mut self,
            user_atts: Mapping,
            managers: &Targets,
        ) -> Result<CallResult, ClientError> {
            require_name("user_atts", &user_atts)?;
            let payload = request(
                "add_user",
                vec![("user_atts", Value::Mapping(user_atts))],
                managers,
            );
            Ok(self.transport.send(&payload).await)
        }

        pub async fn update_user(
            &mut self,
            user_atts: Mapping,
            managers: &Targets,
        ) -> Result<CallResult, ClientError> {
            require_name("user_atts", &user_atts)?;
            let payload = request(
                "update_user",
                vec![("user_atts", Value::Mapping(user_atts))],
                managers,
            );
            Ok(self.transport.send(&payload).await)
        }

        pub async fn delete_user(&mut self, name: String, managers: &Targets) -> CallResult {
            let payload = request("delete_user", vec![("name", Value::String(name))], managers);
            self.transport.send(&payload).await
        }

        pub async fn set_user_default_group(
            &mut self,
            user_name: String,
            group_name: String,
            managers: &Targets,
        ) -> CallResult {
            let payload = request(
                "set_user_default_group",
                vec![
                    ("user_name", Value::String(user_name)),
                    ("group_name", Value::String(group_name)),
                ],
                managers,
            );
            self.transport.send(&payload).await
        }

        pub async fn associate_user_to_group(
            &mut self,
            user_name: String,
            group_name: String,
            managers: &Targets,
        ) -> CallResult {
            let payload = request(
                "associate_user_to_group",
                vec![
                    ("user_name", Value::String(user_name)),
                    ("group_name", Value::String(group_name)),
                ],
                managers,
            );
            self.transport.send(&payload).await
        }

        pub async fn disassociate_user_from_group(
            &mut self,
            user_name: String,
            group_name: String,
            managers: &Targets,
        ) -> CallResult {
            let payload = request(
                "disassociate_user_from_group",
                vec![
                    ("user_name", Value::String(user_name)),
                    ("group_name", Value::String(group_name)),
                ],
                managers,
            );
            self.transport.send(&payload).await
        }

        pub async fn disassociate_users_from_group(
            &mut self,
            user_names: Vec<String>,
            group_name: String,
            managers: &Targets,
        ) -> CallResult {
            let payload = request(
                "disassociate_users_from_group",
                vec![
                    ("user_names", strings(user_names)),
                    ("group_name", Value::String(group_name)),
                ],
                managers,
            );
            self.transport.send(&payload).await
        }
    };
}

/// Event-style client: requests are delivered and forgotten, so only the
/// write vocabulary is available. The returned result reports delivery,
/// not the backend outcome.
pub struct EventClient {
    transport: Box<dyn Transport>,
}

impl EventClient {
    /// A client publishing through a [`Producer`] built from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(Box::new(Producer::from_config(config)?)))
    }

    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    facade_common!();
}

/// Request/reply client: every call returns the backend's aggregated
/// result, so reads are available too.
pub struct MethodClient {
    transport: Box<dyn Transport>,
}

impl MethodClient {
    /// A client calling through an [`RpcClient`] built from `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(Box::new(RpcClient::from_config(config)?)))
    }

    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    facade_common!();

    pub async fn get_group(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("get_group", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    pub async fn list_groups(&mut self, managers: &Targets) -> CallResult {
        let payload = request("list_groups", vec![], managers);
        self.transport.send(&payload).await
    }

    pub async fn get_members(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("get_members", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    pub async fn exists_group(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("exists_group", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    pub async fn get_user(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("get_user", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    pub async fn exists_user(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("exists_user", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    pub async fn list_users(
        &mut self,
        with_default_group: String,
        managers: &Targets,
    ) -> CallResult {
        let payload = request(
            "list_users",
            vec![("with_default_group", Value::String(with_default_group))],
            managers,
        );
        self.transport.send(&payload).await
    }

    pub async fn validate_users(&mut self, names: Vec<String>, managers: &Targets) -> CallResult {
        let payload = request("validate_users", vec![("names", strings(names))], managers);
        self.transport.send(&payload).await
    }

    pub async fn roles_user(&mut self, name: String, managers: &Targets) -> CallResult {
        let payload = request("roles_user", vec![("name", Value::String(name))], managers);
        self.transport.send(&payload).await
    }

    /// Requests an orderly shutdown of the server and returns its
    /// acknowledgement.
    pub async fn close_server(&mut self) -> CallResult {
        let payload = Value::String(crate::transport::CLOSE_SENTINEL.to_owned());
        self.transport.send(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every payload and answers with success.
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, payload: &Value) -> CallResult {
            self.sent.lock().unwrap().push(payload.clone());
            CallResult::ok(Value::Null)
        }

        async fn close(&mut self) {}
    }

    fn recording_client() -> (MethodClient, Arc<Mutex<Vec<Value>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let client = MethodClient::new(Box::new(RecordingTransport { sent: sent.clone() }));
        (client, sent)
    }

    fn atts(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn envelopes_carry_action_params_and_managers() {
        let (mut client, sent) = recording_client();
        client
            .add_group(atts("{name: g1, quota: 5}"), &Targets::Any)
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        let envelope = sent[0].as_mapping().unwrap();
        assert_eq!(envelope.get("action").and_then(Value::as_str), Some("add_group"));
        assert_eq!(envelope.get("managers").and_then(Value::as_str), Some("any"));
        let group = envelope.get("group_atts").and_then(Value::as_mapping).unwrap();
        assert_eq!(group.get("name").and_then(Value::as_str), Some("g1"));
    }

    #[tokio::test]
    async fn attribute_mappings_must_carry_a_name() {
        let (mut client, sent) = recording_client();
        let outcome = client.add_user(atts("{shell: /bin/bash}"), &Targets::Any).await;
        assert!(matches!(outcome, Err(ClientError::MissingName { argument: "user_atts" })));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn targeted_requests_write_the_manager_list() {
        let (mut client, sent) = recording_client();
        client
            .delete_user("u1".into(), &Targets::Named(vec!["DirectoryManager".into()]))
            .await;

        let sent = sent.lock().unwrap();
        let envelope = sent[0].as_mapping().unwrap();
        let managers = envelope.get("managers").and_then(Value::as_sequence).unwrap();
        assert_eq!(managers.len(), 1);
        assert_eq!(managers[0].as_str(), Some("DirectoryManager"));
    }

    #[tokio::test]
    async fn close_server_sends_the_bare_sentinel() {
        let (mut client, sent) = recording_client();
        client.close_server().await;
        assert_eq!(
            sent.lock().unwrap()[0],
            Value::String("CLOSE_IMMEDIATELY".into())
        );
    }

    #[tokio::test]
    async fn ordered_parameters_match_the_schema() {
        let (mut client, sent) = recording_client();
        client
            .disassociate_users_from_group(vec!["u1".into(), "u2".into()], "g".into(), &Targets::Any)
            .await;
        let sent = sent.lock().unwrap();
        let envelope = sent[0].as_mapping().unwrap();
        assert!(envelope.contains_key("user_names"));
        assert!(envelope.contains_key("group_name"));
    }
}
