//! Key registry implementation
//!
//! Holds the authoritative key → IP collection. Every mutation stages a copy
//! of the collection, persists it through the configured [`CredentialStore`]
//! and only then publishes it, all under one write lock. A failed save leaves
//! the published collection untouched.

use crate::errors::*;
use crate::storage::CredentialStore;
use crate::types::*;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts at drawing an unused key before CreateKey gives up.
pub const MAX_KEY_ATTEMPTS: usize = 8;

type Credentials = BTreeMap<AccessKey, Option<String>>;
type KeySource = Box<dyn Fn() -> AccessKey + Send + Sync>;

/// Key registry
///
/// Constructed once per process and shared by handle with every request
/// handler.
pub struct KeyRegistry {
    credentials: RwLock<Credentials>,
    store: Arc<dyn CredentialStore>,
    admin: AdminSecret,
    key_source: KeySource,
}

impl KeyRegistry {
    /// Create a registry hydrated from `store`'s last snapshot
    pub fn open(store: Arc<dyn CredentialStore>, admin: AdminSecret) -> Self {
        Self::with_key_source(store, admin, AccessKey::generate)
    }

    /// Same as [`KeyRegistry::open`] but with a custom key generator
    pub fn with_key_source<F>(
        store: Arc<dyn CredentialStore>,
        admin: AdminSecret,
        source: F,
    ) -> Self
    where
        F: Fn() -> AccessKey + Send + Sync + 'static,
    {
        let mut credentials = Credentials::new();
        for cred in store.load() {
            if credentials.contains_key(&cred.key) {
                warn!("Ignoring duplicate key {}.. in stored snapshot", cred.key.hint());
                continue;
            }
            credentials.insert(cred.key, cred.ip);
        }
        info!(
            "Key registry loaded {} credential(s) from {} store",
            credentials.len(),
            store.kind()
        );

        Self {
            credentials: RwLock::new(credentials),
            store,
            admin,
            key_source: Box::new(source),
        }
    }

    /// Issue a new key with no IP bound
    pub fn create_key(&self, admin_secret: &str) -> Result<AccessKey> {
        self.authorize(admin_secret, "create_key")?;

        let key = self.commit(|credentials| {
            let key = self.fresh_key(credentials)?;
            credentials.insert(key.clone(), None);
            Ok(key)
        })?;

        info!("Created key {}..", key.hint());
        Ok(key)
    }

    /// Snapshot of every credential, ordered by key
    pub fn list_keys(&self, admin_secret: &str) -> Result<Vec<Credential>> {
        self.authorize(admin_secret, "list_keys")?;
        Ok(snapshot(&self.credentials.read()))
    }

    /// Remove `key` from the registry.
    ///
    /// Revoking a key that does not exist succeeds without changing anything.
    pub fn revoke_key(&self, admin_secret: &str, key: &str) -> Result<()> {
        self.authorize(admin_secret, "revoke_key")?;
        if key.is_empty() {
            return Err(RegistryError::missing("key"));
        }

        let removed = self.commit(|credentials| Ok(credentials.remove(key).is_some()))?;
        if removed {
            info!("Revoked key {}..", key_hint(key));
        } else {
            debug!("Revoke of unknown key {}.. is a no-op", key_hint(key));
        }
        Ok(())
    }

    /// Bind `ip` to `key`, replacing any previous binding
    pub fn bind_ip(&self, key: &str, ip: &str) -> Result<Credential> {
        if ip.is_empty() {
            return Err(RegistryError::missing("ip"));
        }

        let credential = self.commit(|credentials| {
            let slot = credentials
                .get_mut(key)
                .ok_or_else(|| RegistryError::not_found(key))?;
            *slot = Some(ip.to_string());
            Ok(Credential::new(AccessKey::new(key), slot.clone()))
        })?;

        info!("Bound key {}.. to {}", credential.key.hint(), ip);
        Ok(credential)
    }

    /// Look up the IP bound to `key`
    pub fn resolve_ip(&self, key: &str) -> Result<Credential> {
        let credentials = self.credentials.read();
        credentials
            .get_key_value(key)
            .map(|(k, ip)| Credential::new(k.clone(), ip.clone()))
            .ok_or_else(|| RegistryError::not_found(key))
    }

    /// Number of live credentials
    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn authorize(&self, admin_secret: &str, operation: &str) -> Result<()> {
        if self.admin.verify(admin_secret) {
            Ok(())
        } else {
            warn!("Rejected {} with invalid admin secret", operation);
            Err(RegistryError::Unauthorized)
        }
    }

    fn fresh_key(&self, credentials: &Credentials) -> Result<AccessKey> {
        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = (self.key_source)();
            if !credentials.contains_key(&key) {
                return Ok(key);
            }
            warn!("Generated key collided with an existing key, retrying");
        }
        Err(RegistryError::KeyCollision {
            attempts: MAX_KEY_ATTEMPTS,
        })
    }

    /// Apply `mutate` to a staged copy, persist it, then publish it.
    fn commit<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Credentials) -> Result<T>,
    {
        let mut published = self.credentials.write();
        let mut staged = published.clone();
        let output = mutate(&mut staged)?;

        if let Err(err) = self.store.save(&snapshot(&staged)) {
            warn!("Failed to persist credentials, discarding change: {:#}", err);
            return Err(RegistryError::PersistenceFailure(err));
        }

        *published = staged;
        Ok(output)
    }
}

impl fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("credentials", &self.len())
            .field("store", &self.store.kind())
            .finish()
    }
}

fn snapshot(credentials: &Credentials) -> Vec<Credential> {
    credentials
        .iter()
        .map(|(key, ip)| Credential::new(key.clone(), ip.clone()))
        .collect()
}
