//! Connection pool manager
//!
//! Owns one [`LiveConnection`] per opened profile name. Opening an open
//! profile only bumps its reference count; the pool and its SSH tunnel are
//! torn down when the count returns to zero.

use crate::config::EngineConfig;
use crate::database::{DatabaseProvider, PooledConn};
use crate::profile::{BackendKind, BackendTarget, ConnectionProfile, ConnectionSecrets};
use crate::schema::OpenConnection;
use crate::ssh::SshTunnel;
use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// An opened profile: its pool and the tunnel the pool dials through
pub struct LiveConnection {
    name: String,
    provider: Arc<dyn DatabaseProvider>,
    tunnel: Option<SshTunnel>,
}

impl std::fmt::Debug for LiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnection")
            .field("name", &self.name)
            .field("backend", &self.provider.backend())
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

impl LiveConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> BackendKind {
        self.provider.backend()
    }

    pub fn provider(&self) -> &dyn DatabaseProvider {
        self.provider.as_ref()
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Close the pool, then the tunnel under it
    async fn shut_down(&self) {
        self.provider.close().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.teardown().await;
        }
    }
}

struct Entry {
    connection: Arc<LiveConnection>,
    refs: usize,
}

/// Registry of live connections keyed by profile name
pub struct PoolManager {
    config: EngineConfig,
    connections: RwLock<HashMap<String, Entry>>,
    /// Serializes open, close and binding per name; never held by
    /// `acquire`. Entries live only while someone holds or awaits them.
    gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PoolManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    /// Hand a gate back, forgetting it when nobody else holds or awaits it
    fn release_gate(&self, name: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference is ours, one is the map's
        if Arc::strong_count(&gate) <= 2
            && gates.get(name).is_some_and(|current| Arc::ptr_eq(current, &gate))
        {
            gates.remove(name);
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Open a profile, or take another reference on its live connection
    ///
    /// # Arguments
    ///
    /// * `profile` - Profile to dial when it is not open yet
    /// * `secrets` - Its stored credentials
    pub async fn open(
        &self,
        profile: &ConnectionProfile,
        secrets: &ConnectionSecrets,
    ) -> Result<Arc<LiveConnection>> {
        let gate = self.gate(&profile.name);
        let opened = {
            let _opening = gate.lock().await;
            self.open_gated(profile, secrets).await
        };
        self.release_gate(&profile.name, gate);
        opened
    }

    async fn open_gated(
        &self,
        profile: &ConnectionProfile,
        secrets: &ConnectionSecrets,
    ) -> Result<Arc<LiveConnection>> {
        if let Some(entry) = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&profile.name)
        {
            entry.refs += 1;
            tracing::debug!(profile = %profile.name, refs = entry.refs, "Connection already open");
            return Ok(Arc::clone(&entry.connection));
        }

        let connection = Arc::new(dial(profile, secrets, &self.config).await?);
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                profile.name.clone(),
                Entry {
                    connection: Arc::clone(&connection),
                    refs: 1,
                },
            );

        tracing::info!(
            profile = %profile.name,
            backend = %connection.backend(),
            tunneled = connection.is_tunneled(),
            "Connection opened"
        );
        Ok(connection)
    }

    /// Run `f` while `name` is open and cannot be closed
    ///
    /// # Returns
    ///
    /// What `f` returned, or [`Error::NotConnected`] without calling it
    pub async fn with_open<T>(&self, name: &str, f: impl FnOnce() -> T) -> Result<T> {
        let gate = self.gate(name);
        let outcome = {
            let _held = gate.lock().await;
            if self.is_open(name) {
                Ok(f())
            } else {
                Err(Error::NotConnected(format!("connection '{name}' is not open")))
            }
        };
        self.release_gate(name, gate);
        outcome
    }

    /// Drop one reference; the last one closes the pool and the tunnel
    ///
    /// Closing a name that is not open does nothing.
    ///
    /// # Returns
    ///
    /// Whether this call tore the connection down
    pub async fn close(&self, name: &str) -> bool {
        self.release(name, async {}).await
    }

    /// Like [`PoolManager::close`], awaiting `before_teardown` once the last
    /// reference is gone and before the pool closes
    ///
    /// Anything still holding a pooled connection (an open transaction) has to
    /// let go in `before_teardown`, or closing the pool waits for it.
    pub async fn release(&self, name: &str, before_teardown: impl Future<Output = ()>) -> bool {
        let gate = self.gate(name);
        let torn_down = {
            let _closing = gate.lock().await;
            let released = {
                let mut connections =
                    self.connections.write().unwrap_or_else(PoisonError::into_inner);
                match connections.get(name).map(|entry| entry.refs) {
                    Some(refs) if refs > 1 => {
                        if let Some(entry) = connections.get_mut(name) {
                            entry.refs -= 1;
                            tracing::debug!(profile = %name, refs = entry.refs, "Connection reference released");
                        }
                        None
                    }
                    Some(_) => connections.remove(name),
                    None => None,
                }
            };

            match released {
                Some(entry) => {
                    before_teardown.await;
                    entry.connection.shut_down().await;
                    tracing::info!(profile = %name, "Connection closed");
                    true
                }
                None => false,
            }
        };
        self.release_gate(name, gate);
        torn_down
    }

    /// Close regardless of the reference count, e.g. when the profile is deleted
    pub async fn force_close(&self, name: &str) -> bool {
        let gate = self.gate(name);
        let torn_down = {
            let _closing = gate.lock().await;
            let removed = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            match removed {
                Some(entry) => {
                    entry.connection.shut_down().await;
                    tracing::info!(profile = %name, refs = entry.refs, "Connection force-closed");
                    true
                }
                None => false,
            }
        };
        self.release_gate(name, gate);
        torn_down
    }

    /// Close every live connection
    pub async fn close_all(&self) {
        let names: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in names {
            self.force_close(&name).await;
        }
    }

    /// The live connection of a profile
    pub fn connection(&self, name: &str) -> Result<Arc<LiveConnection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| Error::NotConnected(format!("connection '{name}' is not open")))
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.ref_count(name) > 0
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |entry| entry.refs)
    }

    /// Borrow a pooled connection; it returns to the pool when dropped
    pub async fn acquire(&self, name: &str) -> Result<PooledConn> {
        let connection = self.connection(name)?;
        tracing::debug!(profile = %name, "Acquiring pooled connection");
        connection.provider().acquire().await
    }

    pub fn list_open(&self) -> Vec<OpenConnection> {
        let mut open: Vec<OpenConnection> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, entry)| OpenConnection {
                name: name.clone(),
                backend: entry.connection.backend(),
                ref_count: entry.refs,
                tunneled: entry.connection.is_tunneled(),
            })
            .collect();
        open.sort_by(|a, b| a.name.cmp(&b.name));
        open
    }

    /// Connect and disconnect right away, without registering anything
    pub async fn test(&self, profile: &ConnectionProfile, secrets: &ConnectionSecrets) -> Result<()> {
        let connection = dial(profile, secrets, &self.config).await?;
        connection.shut_down().await;
        tracing::info!(profile = %profile.name, "Connection test succeeded");
        Ok(())
    }
}

/// Establish the tunnel (if any) and the pool of a profile
async fn dial(
    profile: &ConnectionProfile,
    secrets: &ConnectionSecrets,
    config: &EngineConfig,
) -> Result<LiveConnection> {
    profile.validate()?;

    let (provider, tunnel): (Arc<dyn DatabaseProvider>, Option<SshTunnel>) = match &profile.target {
        #[cfg(feature = "sqlite")]
        BackendTarget::Sqlite { .. } => {
            let provider: Arc<dyn DatabaseProvider> = Arc::new(
                crate::database::sqlite::SqliteProvider::connect(profile, config).await?,
            );
            (provider, None)
        }

        #[cfg(feature = "postgres")]
        BackendTarget::Postgres { host, port, .. } => {
            let tunnel = match &profile.ssh {
                Some(ssh) => Some(
                    SshTunnel::establish(ssh, secrets.ssh_passphrase.as_deref(), host, *port, config)
                        .await?,
                ),
                None => None,
            };

            let connecting = crate::database::postgres::PostgresProvider::connect(
                profile,
                secrets.password.as_deref(),
                tunnel.as_ref().map(SshTunnel::local_addr),
                config,
            )
            .await;

            match connecting {
                Ok(provider) => {
                    let provider: Arc<dyn DatabaseProvider> = Arc::new(provider);
                    (provider, tunnel)
                }
                Err(error) => {
                    if let Some(tunnel) = &tunnel {
                        tunnel.teardown().await;
                    }
                    return Err(error);
                }
            }
        }

        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::InvalidProfile(format!(
                "'{}': the {} backend is not compiled in",
                profile.name,
                profile.kind()
            )))
        }
    };

    Ok(LiveConnection {
        name: profile.name.clone(),
        provider,
        tunnel,
    })
}
