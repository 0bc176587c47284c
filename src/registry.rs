//! Compile-time registry of named constructors.
//!
//! Configuration files refer to plug-ins by key: `HOOKS` lists manager
//! keys, `MQHDLR` names the handler a server role runs, and
//! `ACTIVITY_STREAM_CLASS` / `REACTION_HANDLER` select the journal and
//! reactions implementations. Deployments register their constructors here
//! at startup; an unknown key is a startup error, never a runtime lookup in
//! some dynamic namespace.

use std::collections::HashMap;
use std::future::Future;

use anyhow::bail;
use futures::future::BoxFuture;

use crate::activity::{ActivityStream, SqliteActivityStream};
use crate::config::Config;
use crate::dispatch::Handler;
use crate::manager::Manager;
use crate::reactions::Reactions;
use crate::router::Router;

/// Handler key every server deployment gets for free.
pub const ROUTER_HANDLER: &str = "router";

/// Journal key for the built-in SQLite activity stream.
pub const SQLITE_JOURNAL: &str = "sqlite";

type Factory<T> = Box<dyn Fn(Config) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Named constructors for every pluggable piece of a deployment.
#[derive(Default)]
pub struct Registry {
    managers: HashMap<String, Factory<Box<dyn Manager>>>,
    journals: HashMap<String, Factory<Box<dyn ActivityStream>>>,
    reactions: HashMap<String, Factory<Box<dyn Reactions>>>,
    handlers: HashMap<String, Factory<Box<dyn Handler>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry carrying the built-in constructors: the SQLite journal.
    /// (The router handler needs the registry itself and is resolved in
    /// [`Registry::handler`].)
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_journal(SQLITE_JOURNAL, |config| async move {
            let path = config.activity_stream_database()?;
            let stream = SqliteActivityStream::open(&path).await?;
            Ok(Box::new(stream) as Box<dyn ActivityStream>)
        });
        registry
    }

    pub fn register_manager<F, Fut>(&mut self, key: &str, factory: F)
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<dyn Manager>>> + Send + 'static,
    {
        self.managers
            .insert(key.to_owned(), Box::new(move |config| Box::pin(factory(config))));
    }

    pub fn register_journal<F, Fut>(&mut self, key: &str, factory: F)
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<dyn ActivityStream>>> + Send + 'static,
    {
        self.journals
            .insert(key.to_owned(), Box::new(move |config| Box::pin(factory(config))));
    }

    pub fn register_reactions<F, Fut>(&mut self, key: &str, factory: F)
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<dyn Reactions>>> + Send + 'static,
    {
        self.reactions
            .insert(key.to_owned(), Box::new(move |config| Box::pin(factory(config))));
    }

    pub fn register_handler<F, Fut>(&mut self, key: &str, factory: F)
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<dyn Handler>>> + Send + 'static,
    {
        self.handlers
            .insert(key.to_owned(), Box::new(move |config| Box::pin(factory(config))));
    }

    /// Constructs the manager registered under `key`.
    pub async fn manager(&self, key: &str, config: &Config) -> anyhow::Result<Box<dyn Manager>> {
        match self.managers.get(key) {
            Some(factory) => factory(config.clone()).await,
            None => bail!("no manager is registered for key {key}"),
        }
    }

    /// Constructs the journal registered under `key`.
    pub async fn journal(
        &self,
        key: &str,
        config: &Config,
    ) -> anyhow::Result<Box<dyn ActivityStream>> {
        match self.journals.get(key) {
            Some(factory) => factory(config.clone()).await,
            None => bail!("no activity stream is registered for key {key}"),
        }
    }

    /// Constructs the reactions component registered under `key`.
    pub async fn reactions(&self, key: &str, config: &Config) -> anyhow::Result<Box<dyn Reactions>> {
        match self.reactions.get(key) {
            Some(factory) => factory(config.clone()).await,
            None => bail!("no reaction handler is registered for key {key}"),
        }
    }

    /// Constructs the handler registered under `key`. The `router` key is
    /// built in and fans out to this registry's managers.
    pub async fn handler(&self, key: &str, config: &Config) -> anyhow::Result<Box<dyn Handler>> {
        if key == ROUTER_HANDLER {
            let router = Router::from_config(config, self).await?;
            return Ok(Box::new(router));
        }
        match self.handlers.get(key) {
            Some(factory) => factory(config.clone()).await,
            None => bail!("no handler is registered for key {key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_keys_are_errors() {
        let registry = Registry::new();
        let config = Config::default();
        assert!(registry.manager("nope", &config).await.is_err());
        assert!(registry.journal("nope", &config).await.is_err());
        assert!(registry.reactions("nope", &config).await.is_err());
        assert!(registry.handler("nope", &config).await.is_err());
    }

    #[tokio::test]
    async fn defaults_carry_the_sqlite_journal() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = serde_yaml::Mapping::new();
        map.insert(
            serde_yaml::Value::String("ACTIVITY_STREAM_DATABASE".into()),
            serde_yaml::Value::String(
                dir.path().join("events.db").to_string_lossy().into_owned(),
            ),
        );
        let config = Config::from_mapping(&map);
        let registry = Registry::with_defaults();
        assert!(registry.journal(SQLITE_JOURNAL, &config).await.is_ok());
    }
}
