//! Layered configuration.
//!
//! A single YAML file holds every role's settings under a top-level
//! `METAROOT` key: a `GLOBAL` section plus one section per role key. A
//! process picks its role at startup; the role section is layered over
//! `GLOBAL` and the merged view is handed around as an explicit [`Config`]
//! value. There is no global lookup at call sites.
//!
//! Four broker connection keys can be overridden from the process
//! environment so that credentials stay out of the file.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use nutype::nutype;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::logging::Verbosity;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "METAROOT_CONFIG_FILE";

/// Top-level key the configuration tree lives under.
const ROOT_KEY: &str = "METAROOT";

/// Section layered under every role.
const GLOBAL_SECTION: &str = "GLOBAL";

/// File names probed in each directory, in precedence order.
const FILE_CANDIDATES: &[&str] = &["metaroot-test.yaml", "metaroot.yaml"];

/// How many parent directories the search may climb.
const MAX_PARENT_HOPS: usize = 4;

/// Broker connection keys overridable from the environment.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("METAROOT_MQUSER", keys::MQUSER),
    ("METAROOT_MQPASS", keys::MQPASS),
    ("METAROOT_MQHOST", keys::MQHOST),
    ("METAROOT_MQPORT", keys::MQPORT),
];

/// Recognized configuration keys.
pub mod keys {
    pub const MQUSER: &str = "MQUSER";
    pub const MQPASS: &str = "MQPASS";
    pub const MQHOST: &str = "MQHOST";
    pub const MQPORT: &str = "MQPORT";
    pub const MQNAME: &str = "MQNAME";
    pub const MQHDLR: &str = "MQHDLR";
    pub const LOG_FILE: &str = "LOG_FILE";
    pub const SCREEN_VERBOSITY: &str = "SCREEN_VERBOSITY";
    pub const FILE_VERBOSITY: &str = "FILE_VERBOSITY";
    pub const HOOKS: &str = "HOOKS";
    pub const ACTIVITY_STREAM_CLASS: &str = "ACTIVITY_STREAM_CLASS";
    pub const ACTIVITY_STREAM_DATABASE: &str = "ACTIVITY_STREAM_DATABASE";
    pub const READ_ONLY_ENABLED: &str = "READ_ONLY_ENABLED";
    pub const SSL: &str = "SSL";
    pub const SSL_VERIFY_MODE: &str = "SSL_VERIFY_MODE";
    pub const SSL_NOCHECK_HOSTNAME: &str = "SSL_NOCHECK_HOSTNAME";
    pub const REACTION_HANDLER: &str = "REACTION_HANDLER";
    pub const REACTION_NOTIFY: &str = "REACTION_NOTIFY";
}

/// Sentinel value disabling a feature ("no log file", "no journal").
pub const NONE_SENTINEL: &str = "$NONE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate a configuration file in any standard location")]
    NotFound,
    #[error("could not read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse configuration file: {source}")]
    Parse {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("configuration has no top-level `METAROOT` mapping")]
    MissingRoot,
    #[error("no configuration section for role {role}")]
    MissingSection { role: String },
    #[error("configuration key {key} is not set")]
    MissingKey { key: &'static str },
    #[error("configuration key {key} is invalid: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Section name a process selects at startup. Uppercased on construction, as
/// sections are named in the file.
#[nutype(
    sanitize(with = |s: String| s.trim().to_ascii_uppercase()),
    validate(predicate = |s| !s.is_empty()),
    derive(Clone, Debug, Display, Eq, PartialEq, Deref)
)]
pub struct RoleKey(String);

/// Name of a broker queue. Never empty.
#[nutype(
    sanitize(with = |s: String| s.trim().to_owned()),
    validate(predicate = |s| !s.is_empty()),
    derive(Clone, Debug, Display, Eq, PartialEq, Deref)
)]
pub struct QueueName(String);

/// The parsed configuration file: every role section, unmerged.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    sections: Mapping,
}

impl ConfigFile {
    /// Locates and loads the configuration file.
    ///
    /// Search order: the `METAROOT_CONFIG_FILE` environment variable, then
    /// `metaroot-test.yaml`, then `metaroot.yaml`, first in the working
    /// directory and then in up to four parent directories.
    pub fn discover() -> Result<Self, ConfigError> {
        let cwd = env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        let env_file = env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        let path = locate(&cwd, env_file.as_deref()).ok_or(ConfigError::NotFound)?;
        Self::load_from(&path)
    }

    /// Loads the file at `path` and applies the environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root: Value = serde_yaml::from_str(&text)?;
        Self::from_value(root, |key| env::var(key).ok())
    }

    /// Builds the tree from an already-parsed value. `env_lookup` supplies
    /// the broker override variables.
    pub fn from_value(
        root: Value,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut sections = root
            .as_mapping()
            .and_then(|map| map.get(ROOT_KEY))
            .and_then(Value::as_mapping)
            .cloned()
            .ok_or(ConfigError::MissingRoot)?;

        let mut global = sections
            .get(GLOBAL_SECTION)
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        for (variable, key) in ENV_OVERRIDES {
            if let Some(value) = env_lookup(variable) {
                global.insert(Value::String((*key).to_owned()), Value::String(value));
            }
        }
        sections.insert(
            Value::String(GLOBAL_SECTION.to_owned()),
            Value::Mapping(global),
        );

        Ok(Self { sections })
    }

    /// The merged view for `role`: its section layered over `GLOBAL`.
    pub fn section(&self, role: &RoleKey) -> Result<Config, ConfigError> {
        let role_map = self
            .sections
            .get(role.as_str())
            .and_then(Value::as_mapping)
            .ok_or_else(|| ConfigError::MissingSection {
                role: role.to_string(),
            })?;
        let mut config = self.global();
        config.populate(role_map);
        Ok(config)
    }

    /// The `GLOBAL` parameters alone.
    pub fn global(&self) -> Config {
        let mut config = Config::default();
        if let Some(global) = self.sections.get(GLOBAL_SECTION).and_then(Value::as_mapping) {
            config.populate(global);
        }
        config
    }
}

/// A merged, read-only key/value view with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
}

impl Config {
    /// A config holding the entries of `map`. Defaults for absent keys are
    /// supplied by the accessors.
    pub fn from_mapping(map: &Mapping) -> Self {
        let mut config = Self::default();
        config.populate(map);
        config
    }

    fn populate(&mut self, map: &Mapping) {
        for (key, value) in map {
            if let Some(key) = key.as_str() {
                self.values.insert(key.to_owned(), value.clone());
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Iterates every key/value pair, for debug dumps.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn string(&self, key: &'static str) -> Result<String, ConfigError> {
        let value = self.values.get(key).ok_or(ConfigError::MissingKey { key })?;
        scalar_to_string(value).ok_or_else(|| ConfigError::InvalidValue {
            key,
            reason: "expected a scalar value".to_owned(),
        })
    }

    fn string_or(&self, key: &'static str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(scalar_to_string)
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn mq_user(&self) -> Result<String, ConfigError> {
        self.string(keys::MQUSER)
    }

    pub fn mq_pass(&self) -> Result<String, ConfigError> {
        self.string(keys::MQPASS)
    }

    pub fn mq_host(&self) -> Result<String, ConfigError> {
        self.string(keys::MQHOST)
    }

    pub fn mq_port(&self) -> Result<u16, ConfigError> {
        let raw = self.string(keys::MQPORT)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: keys::MQPORT,
            reason: format!("{raw} is not a port number"),
        })
    }

    pub fn queue_name(&self) -> Result<QueueName, ConfigError> {
        QueueName::try_new(self.string(keys::MQNAME)?).map_err(|_| ConfigError::InvalidValue {
            key: keys::MQNAME,
            reason: "queue name is empty".to_owned(),
        })
    }

    /// Registry key of the handler this role runs.
    pub fn handler_class(&self) -> Result<String, ConfigError> {
        self.string(keys::MQHDLR)
    }

    /// Log file sink, or `None` when disabled with `$NONE`.
    pub fn log_file(&self) -> Option<PathBuf> {
        let raw = self.string_or(keys::LOG_FILE, "metaroot.log");
        if raw == NONE_SENTINEL {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    }

    pub fn screen_verbosity(&self) -> Result<Verbosity, ConfigError> {
        self.verbosity(keys::SCREEN_VERBOSITY)
    }

    pub fn file_verbosity(&self) -> Result<Verbosity, ConfigError> {
        self.verbosity(keys::FILE_VERBOSITY)
    }

    fn verbosity(&self, key: &'static str) -> Result<Verbosity, ConfigError> {
        let raw = self.string_or(key, "INFO");
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            reason: format!("{raw} is not a log level"),
        })
    }

    /// Ordered registry keys of the manager plug-ins this role fans out to.
    pub fn hooks(&self) -> Result<Vec<String>, ConfigError> {
        let key = keys::HOOKS;
        let value = self.values.get(key).ok_or(ConfigError::MissingKey { key })?;
        let list = value.as_sequence().ok_or_else(|| ConfigError::InvalidValue {
            key,
            reason: "expected a list of manager names".to_owned(),
        })?;
        list.iter()
            .map(|entry| {
                entry
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key,
                        reason: "manager names must be strings".to_owned(),
                    })
            })
            .collect()
    }

    /// Journal registry key; defaults to the `$NONE` sentinel.
    pub fn activity_stream_class(&self) -> String {
        self.string_or(keys::ACTIVITY_STREAM_CLASS, NONE_SENTINEL)
    }

    pub fn activity_stream_database(&self) -> Result<String, ConfigError> {
        self.string(keys::ACTIVITY_STREAM_DATABASE)
    }

    /// Presence of the key enables the gate, whatever its value.
    pub fn read_only_enabled(&self) -> bool {
        self.has(keys::READ_ONLY_ENABLED)
    }

    /// Presence of the key turns on TLS.
    pub fn ssl_enabled(&self) -> bool {
        self.has(keys::SSL)
    }

    pub fn ssl_verify_mode(&self) -> Result<TlsVerifyMode, ConfigError> {
        match self.string_or(keys::SSL_VERIFY_MODE, "REQUIRED").as_str() {
            "NONE" => Ok(TlsVerifyMode::None),
            "OPTIONAL" => Ok(TlsVerifyMode::Optional),
            "REQUIRED" => Ok(TlsVerifyMode::Required),
            other => Err(ConfigError::InvalidValue {
                key: keys::SSL_VERIFY_MODE,
                reason: format!("{other} is not NONE, OPTIONAL, or REQUIRED"),
            }),
        }
    }

    pub fn ssl_nocheck_hostname(&self) -> bool {
        self.has(keys::SSL_NOCHECK_HOSTNAME)
    }

    /// Registry key of the reactions plug-in, if one is configured.
    pub fn reaction_handler(&self) -> Option<String> {
        self.values
            .get(keys::REACTION_HANDLER)
            .and_then(scalar_to_string)
    }

    /// Recipient for the default operator notifications.
    pub fn reaction_notify(&self) -> Option<String> {
        self.values
            .get(keys::REACTION_NOTIFY)
            .and_then(scalar_to_string)
    }
}

/// How strictly the broker's TLS certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerifyMode {
    None,
    Optional,
    Required,
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Walks the candidate locations for a configuration file.
fn locate(start: &Path, env_file: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = env_file {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    let mut dir = start.to_path_buf();
    for _ in 0..=MAX_PARENT_HOPS {
        for candidate in FILE_CANDIDATES {
            let path = dir.join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        if !dir.pop() {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    const SAMPLE: &str = r"
METAROOT:
  GLOBAL:
    MQUSER: guest
    MQPASS: guest
    MQHOST: localhost
    MQPORT: 5672
    SCREEN_VERBOSITY: WARN
  ROUTER:
    MQNAME: admin-requests
    MQHDLR: router
    HOOKS: [scheduler, directory]
    SCREEN_VERBOSITY: DEBUG
    READ_ONLY_ENABLED: yes
";

    #[test]
    fn role_section_overrides_global() {
        let file = ConfigFile::from_value(tree(SAMPLE), |_| None).unwrap();
        let config = file.section(&RoleKey::try_new("router".to_owned()).unwrap()).unwrap();
        assert_eq!(config.mq_user().unwrap(), "guest");
        assert_eq!(config.mq_port().unwrap(), 5672);
        assert_eq!(config.queue_name().unwrap().to_string(), "admin-requests");
        assert_eq!(config.screen_verbosity().unwrap(), Verbosity::Debug);
        assert_eq!(config.hooks().unwrap(), vec!["scheduler", "directory"]);
        assert!(config.read_only_enabled());
    }

    #[test]
    fn environment_overrides_broker_keys() {
        let file = ConfigFile::from_value(tree(SAMPLE), |key| match key {
            "METAROOT_MQHOST" => Some("broker.example.org".to_owned()),
            "METAROOT_MQPORT" => Some("5671".to_owned()),
            _ => None,
        })
        .unwrap();
        let config = file.global();
        assert_eq!(config.mq_host().unwrap(), "broker.example.org");
        assert_eq!(config.mq_port().unwrap(), 5671);
        // Untouched keys keep their file values.
        assert_eq!(config.mq_user().unwrap(), "guest");
    }

    #[test]
    fn missing_role_section_is_an_error() {
        let file = ConfigFile::from_value(tree(SAMPLE), |_| None).unwrap();
        let missing = file.section(&RoleKey::try_new("nope".to_owned()).unwrap());
        assert!(matches!(missing, Err(ConfigError::MissingSection { .. })));
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let file = ConfigFile::from_value(tree(SAMPLE), |_| None).unwrap();
        let config = file.global();
        assert_eq!(config.log_file(), Some(PathBuf::from("metaroot.log")));
        assert_eq!(config.file_verbosity().unwrap(), Verbosity::Info);
        assert_eq!(config.activity_stream_class(), NONE_SENTINEL);
        assert!(!config.read_only_enabled());
        assert!(!config.ssl_enabled());
    }

    #[test]
    fn none_sentinel_disables_the_log_file() {
        let mut map = Mapping::new();
        map.insert(Value::String(keys::LOG_FILE.into()), Value::String(NONE_SENTINEL.into()));
        let config = Config::from_mapping(&map);
        assert_eq!(config.log_file(), None);
    }

    #[test]
    fn role_keys_are_uppercased() {
        assert_eq!(RoleKey::try_new("router".to_owned()).unwrap().to_string(), "ROUTER");
        assert!(RoleKey::try_new("  ".to_owned()).is_err());
    }

    #[test]
    fn test_file_takes_precedence_in_discovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metaroot.yaml"), "a").unwrap();
        std::fs::write(dir.path().join("metaroot-test.yaml"), "b").unwrap();
        let found = locate(dir.path(), None).unwrap();
        assert!(found.ends_with("metaroot-test.yaml"));
    }

    #[test]
    fn discovery_climbs_at_most_four_parents() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("metaroot.yaml"), "a").unwrap();
        let mut deep = root.path().to_path_buf();
        for level in ["a", "b", "c", "d"] {
            deep = deep.join(level);
        }
        std::fs::create_dir_all(&deep).unwrap();
        assert!(locate(&deep, None).is_some());

        let deeper = deep.join("e");
        std::fs::create_dir_all(&deeper).unwrap();
        // Five hops away: out of range unless some ancestor outside the
        // tempdir happens to carry a config file of its own.
        let found = locate(&deeper, None);
        assert!(found.is_none() || !found.unwrap().starts_with(root.path()));
    }

    #[test]
    fn explicit_env_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let pinned = dir.path().join("pinned.yaml");
        std::fs::write(&pinned, "x").unwrap();
        std::fs::write(dir.path().join("metaroot-test.yaml"), "y").unwrap();
        assert_eq!(locate(dir.path(), Some(&pinned)).unwrap(), pinned);
    }
}
