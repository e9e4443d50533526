//! Cluster-wide claim table keyed by tenant id.
//!
//! # Purpose
//! Gives every key at most one live owner. Ownership is tied to the
//! [`Registration`] guard returned by a successful claim: dropping the guard
//! (normally because the owning task ended) removes the entry, so entries are
//! scoped to owner liveness and are never deleted independently.
//!
//! # Concurrency + ordering guarantees
//! - `register_if_absent` is atomic; concurrent claims for one key resolve to
//!   exactly one winner, losers receive the winner's value.
//! - Only the holder of a `Registration` may update that entry's value.
//! - Each claim gets a generation number so a stale guard never removes a
//!   newer owner's entry.
//!
//! ```
//! use ember_registry::{Claim, ClusterRegistry};
//!
//! let registry = ClusterRegistry::new();
//! let Claim::Registered(guard) = registry.register_if_absent("t1", 1u32).expect("claim") else {
//!     panic!("fresh registry");
//! };
//! assert!(matches!(
//!     registry.register_if_absent("t1", 2).expect("claim"),
//!     Claim::AlreadyRegistered(1)
//! ));
//! drop(guard);
//! assert_eq!(registry.lookup("t1").expect("lookup"), None);
//! ```
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry unavailable")]
    Unavailable,
    #[error("registration for {0} is no longer owned by this guard")]
    NotOwner(String),
}

#[derive(Debug)]
struct Slot<V> {
    generation: u64,
    value: V,
}

#[derive(Debug)]
struct Inner<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    available: AtomicBool,
    next_generation: AtomicU64,
}

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum Claim<V> {
    Registered(Registration<V>),
    AlreadyRegistered(V),
}

pub struct ClusterRegistry<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ClusterRegistry<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for ClusterRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("entries", &self.inner.entries.lock().len())
            .field("available", &self.inner.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: Clone> Default for ClusterRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ClusterRegistry<V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<Option<V>> {
        self.ensure_available()?;
        Ok(self
            .inner
            .entries
            .lock()
            .get(key)
            .map(|slot| slot.value.clone()))
    }

    pub fn register_if_absent(&self, key: impl Into<String>, value: V) -> Result<Claim<V>> {
        self.ensure_available()?;
        let key = key.into();
        let mut entries = self.inner.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return Ok(Claim::AlreadyRegistered(existing.value.clone()));
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.clone(), Slot { generation, value });
        tracing::debug!(key = %key, generation, "registry claim");
        Ok(Claim::Registered(Registration {
            key,
            generation,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Marks the registry reachable or not. While unavailable, lookups and
    /// claims fail with [`RegistryError::Unavailable`]; existing entries and
    /// guards are untouched.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Relaxed);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable)
        }
    }
}

/// Liveness token for a claimed key. Dropping it removes the entry.
pub struct Registration<V> {
    key: String,
    generation: u64,
    inner: Weak<Inner<V>>,
}

impl<V> fmt::Debug for Registration<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<V> Registration<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Atomically transforms the value stored for this registration.
    pub fn update(&self, f: impl FnOnce(&mut V)) -> Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| RegistryError::NotOwner(self.key.clone()))?;
        let mut entries = inner.entries.lock();
        match entries.get_mut(&self.key) {
            Some(slot) if slot.generation == self.generation => {
                f(&mut slot.value);
                Ok(())
            }
            _ => Err(RegistryError::NotOwner(self.key.clone())),
        }
    }
}

impl<V> Drop for Registration<V> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut entries = inner.entries.lock();
        if entries
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            entries.remove(&self.key);
            tracing::debug!(key = %self.key, generation = self.generation, "registry release");
        }
    }
}
