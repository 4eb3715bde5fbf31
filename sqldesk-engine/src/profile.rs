//! Connection profiles and the storage seams around them
//!
//! Profiles are the persisted definition of a database target. Credentials
//! never live inside a profile: they are kept by the [`ProfileStore`] next to
//! it and fetched by connection name when a connection is opened.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

pub const TAG_PROD: &str = "prod";
pub const TAG_PRODUCTION: &str = "production";
pub const TAG_STAGING: &str = "staging";
pub const TAG_DEV: &str = "dev";
pub const TAG_DEVELOPMENT: &str = "development";
pub const TAG_LOCAL: &str = "local";
pub const TAG_SENSITIVE: &str = "sensitive";

/// Persisted definition of a database target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Unique key of the profile
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub target: BackendTarget,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshTunnelConfig>,
}

/// Backend kind plus its backend-specific fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendTarget {
    Postgres {
        host: String,
        port: u16,
        database: String,
        username: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => f.write_str("postgres"),
            BackendKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuthMode,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SshAuthMode {
    /// Delegate to the SSH agent behind `SSH_AUTH_SOCK`
    Agent,
    /// Load a private key file, decrypting it with the stored passphrase
    #[serde(rename_all = "camelCase")]
    Key { key_path: PathBuf },
}

/// Environment derived from a profile's tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Local,
    Unclassified,
}

impl ConnectionProfile {
    pub fn sqlite(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            target: BackendTarget::Sqlite { path: path.into() },
            ssh: None,
        }
    }

    pub fn postgres(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            target: BackendTarget::Postgres {
                host: host.into(),
                port,
                database: database.into(),
                username: username.into(),
            },
            ssh: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ssh(mut self, ssh: SshTunnelConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn kind(&self) -> BackendKind {
        match self.target {
            BackendTarget::Postgres { .. } => BackendKind::Postgres,
            BackendTarget::Sqlite { .. } => BackendKind::Sqlite,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Destructive statements against dangerous profiles need confirmation
    pub fn is_dangerous(&self) -> bool {
        [TAG_PROD, TAG_PRODUCTION, TAG_SENSITIVE]
            .iter()
            .any(|tag| self.has_tag(tag))
    }

    pub fn environment(&self) -> Environment {
        if self.has_tag(TAG_PROD) || self.has_tag(TAG_PRODUCTION) {
            Environment::Production
        } else if self.has_tag(TAG_STAGING) {
            Environment::Staging
        } else if self.has_tag(TAG_DEV) || self.has_tag(TAG_DEVELOPMENT) {
            Environment::Development
        } else if self.has_tag(TAG_LOCAL) {
            Environment::Local
        } else {
            Environment::Unclassified
        }
    }

    /// Human-readable description of where this profile points, for errors
    pub fn target_description(&self) -> String {
        let target = match &self.target {
            BackendTarget::Postgres {
                host,
                port,
                database,
                username,
            } => format!("postgres://{username}@{host}:{port}/{database}"),
            BackendTarget::Sqlite { path } => format!("sqlite:{}", path.display()),
        };

        match &self.ssh {
            Some(ssh) => format!("{target} via ssh://{}@{}:{}", ssh.username, ssh.host, ssh.port),
            None => target,
        }
    }

    /// Reject profiles that cannot be opened before anything is dialed
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidProfile("profile name is empty".to_string()));
        }
        if self.ssh.is_some() && self.kind() == BackendKind::Sqlite {
            return Err(Error::InvalidProfile(format!(
                "'{}': an SSH tunnel cannot be used with an embedded database file",
                self.name
            )));
        }
        Ok(())
    }
}

/// Credentials stored next to a profile
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSecrets {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_passphrase: Option<String>,
}

impl ConnectionSecrets {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ssh_passphrase: None,
        }
    }

    /// Overlay the fields that are set in `update`
    pub fn merge(&mut self, update: ConnectionSecrets) {
        if update.password.is_some() {
            self.password = update.password;
        }
        if update.ssh_passphrase.is_some() {
            self.ssh_passphrase = update.ssh_passphrase;
        }
    }
}

impl fmt::Debug for ConnectionSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("ConnectionSecrets")
            .field("password", &redact(&self.password))
            .field("ssh_passphrase", &redact(&self.ssh_passphrase))
            .finish()
    }
}

/// Persisted connection profiles and their credentials
///
/// The engine only consumes this seam; encryption and file layout are the
/// implementor's concern.
#[async_trait]
pub trait ProfileStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<ConnectionProfile>>;

    async fn get(&self, name: &str) -> Result<Option<ConnectionProfile>>;

    /// Insert or replace a profile
    ///
    /// # Arguments
    ///
    /// * `profile` - The profile, keyed by its name
    /// * `secrets` - New credentials to store; `None` keeps the stored ones,
    ///   and unset fields inside `Some` keep their stored values too
    async fn save(&self, profile: ConnectionProfile, secrets: Option<ConnectionSecrets>)
        -> Result<()>;

    /// Remove a profile and its credentials; returns whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn secrets(&self, name: &str) -> Result<ConnectionSecrets>;
}

/// Key-value store for UI preferences, passed through untouched
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

#[derive(Debug)]
struct StoredProfile {
    profile: ConnectionProfile,
    secrets: ConnectionSecrets,
}

/// Process-local [`ProfileStore`]
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: RwLock<Vec<StoredProfile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn list(&self) -> Result<Vec<ConnectionProfile>> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(profiles.iter().map(|stored| stored.profile.clone()).collect())
    }

    async fn get(&self, name: &str) -> Result<Option<ConnectionProfile>> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(profiles
            .iter()
            .find(|stored| stored.profile.name == name)
            .map(|stored| stored.profile.clone()))
    }

    async fn save(
        &self,
        profile: ConnectionProfile,
        secrets: Option<ConnectionSecrets>,
    ) -> Result<()> {
        profile.validate()?;

        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let existing = profiles
            .iter_mut()
            .find(|stored| stored.profile.name == profile.name);

        match existing {
            Some(stored) => {
                stored.profile = profile;
                if let Some(secrets) = secrets {
                    stored.secrets.merge(secrets);
                }
            }
            None => profiles.push(StoredProfile {
                profile,
                secrets: secrets.unwrap_or_default(),
            }),
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let before = profiles.len();
        profiles.retain(|stored| stored.profile.name != name);
        Ok(profiles.len() != before)
    }

    async fn secrets(&self, name: &str) -> Result<ConnectionSecrets> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        profiles
            .iter()
            .find(|stored| stored.profile.name == name)
            .map(|stored| stored.secrets.clone())
            .ok_or_else(|| Error::ProfileNotFound(name.to_string()))
    }
}

/// Process-local [`SettingsStore`]
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn save(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tags: &[&str]) -> ConnectionProfile {
        ConnectionProfile::sqlite("db", "/tmp/db.sqlite").with_tags(tags.iter().copied())
    }

    #[test]
    fn test_environment_from_tags() {
        assert_eq!(tagged(&["PROD"]).environment(), Environment::Production);
        assert_eq!(tagged(&["production"]).environment(), Environment::Production);
        assert_eq!(tagged(&["staging"]).environment(), Environment::Staging);
        assert_eq!(tagged(&["dev"]).environment(), Environment::Development);
        assert_eq!(tagged(&["local", "team-a"]).environment(), Environment::Local);
        assert_eq!(tagged(&[]).environment(), Environment::Unclassified);
    }

    #[test]
    fn test_dangerous_tags() {
        assert!(tagged(&["prod"]).is_dangerous());
        assert!(tagged(&["Sensitive"]).is_dangerous());
        assert!(!tagged(&["staging", "dev"]).is_dangerous());
    }

    #[test]
    fn test_profile_json_shape() {
        let profile = ConnectionProfile::postgres("main", "db.internal", 5432, "app", "alice")
            .with_tags(["prod"])
            .with_ssh(SshTunnelConfig {
                host: "bastion".to_string(),
                port: 22,
                username: "alice".to_string(),
                auth: SshAuthMode::Key {
                    key_path: PathBuf::from("/home/alice/.ssh/id_ed25519"),
                },
            });

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["type"], "postgres");
        assert_eq!(json["host"], "db.internal");
        assert_eq!(json["ssh"]["auth"]["mode"], "key");
        assert_eq!(json["ssh"]["auth"]["keyPath"], "/home/alice/.ssh/id_ed25519");

        let back: ConnectionProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_ssh_on_sqlite_is_invalid() {
        let profile = ConnectionProfile::sqlite("file", "/tmp/x.db").with_ssh(SshTunnelConfig {
            host: "h".to_string(),
            port: 22,
            username: "u".to_string(),
            auth: SshAuthMode::Agent,
        });
        assert!(matches!(profile.validate(), Err(Error::InvalidProfile(_))));
    }

    #[test]
    fn test_secrets_debug_is_redacted() {
        let secrets = ConnectionSecrets::password("hunter2");
        let debug = format!("{secrets:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_secrets_on_resave() {
        let store = InMemoryProfileStore::new();
        let profile = ConnectionProfile::sqlite("db", "/tmp/db.sqlite");

        store
            .save(profile.clone(), Some(ConnectionSecrets::password("first")))
            .await
            .unwrap();
        store.save(profile.with_tags(["dev"]), None).await.unwrap();

        assert_eq!(store.get("db").await.unwrap().unwrap().tags, vec!["dev"]);
        assert_eq!(
            store.secrets("db").await.unwrap().password.as_deref(),
            Some("first")
        );

        assert!(store.delete("db").await.unwrap());
        assert!(!store.delete("db").await.unwrap());
        assert!(matches!(
            store.secrets("db").await,
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_pass_through() {
        let store = InMemorySettingsStore::new();
        assert_eq!(store.get("layout").await.unwrap(), None);

        let value = serde_json::json!({ "treeWidth": 200.0, "showTree": true });
        store.save("layout", value.clone()).await.unwrap();
        assert_eq!(store.get("layout").await.unwrap(), Some(value));
    }
}
