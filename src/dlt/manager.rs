//! This file contains the [`DltManager`] - the owner of every [`Dlt`] version known to a node.
//!
//! The manager keeps a bounded history of tables keyed by version plus a pointer to the
//! current (committed) one. Readers lease the current table ([`DltManager::get_current`] /
//! [`DltManager::lease_current`]) and must give the lease back when done. A table that is no
//! longer current is only evicted once all its leases were returned.
//!
//! When a new version is added while the previous one is still leased, the manager returns
//! [`Commit::IoPending`] and keeps the provided callback around. The callback is invoked, exactly
//! once, when the last lease on the previous version is released.
//!
//! Every mutation happens under a single mutex which is only held for map/pointer updates.
//! Reading a leased table doesn't require the lock.
use std::{
    collections::{BTreeMap, HashMap},
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{event, instrument, Level};

use super::{Dlt, DltDiff};
use crate::error::{Error, Result};

/// Callback fired once the last lease on a retired version is released.
/// It receives the retired version.
pub type RetireCallback = Box<dyn FnOnce(u64) + Send + 'static>;

/// Outcome of adding a new version to the [`DltManager`]. Neither variant is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// The new version is current and the previous one had no outstanding leases
    Done,
    /// The new version is current but the previous one is still leased. The registered
    /// callback fires once those leases are released.
    IoPending,
}

#[derive(Clone)]
pub struct DltManager {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    tables: BTreeMap<u64, Arc<Dlt>>,
    current: Option<u64>,
    callbacks: HashMap<u64, RetireCallback>,
    max_tables: usize,
}

impl std::fmt::Debug for DltManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => f
                .debug_struct("DltManager")
                .field("current", &inner.current)
                .field("versions", &inner.tables.keys().collect::<Vec<_>>())
                .field("max_tables", &inner.max_tables)
                .finish(),
            Err(_) => {
                write!(f, "Unable to acquire lock for logging at this time...")
            }
        }
    }
}

impl DltManager {
    /// Constructs a manager that keeps at most `max_tables` versions around (leased versions
    /// are never evicted, so the history can temporarily grow above this bound).
    pub fn new(max_tables: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tables: BTreeMap::new(),
                current: None,
                callbacks: HashMap::new(),
                max_tables: max_tables.max(1),
            })),
        }
    }

    fn acquire_lock(&self) -> Result<MutexGuard<Inner>> {
        self.inner.lock().map_err(|_| Error::Logic {
            reason: "Unable to acquire DltManager lock".to_string(),
        })
    }

    /// Inserts `dlt` as the new current version.
    ///
    /// If the previous current version still has leases, `on_retired` is registered and
    /// [`Commit::IoPending`] is returned. Otherwise the previous version is retired right away,
    /// `on_retired` is dropped and [`Commit::Done`] is returned.
    ///
    /// # Errors
    ///  1. [`Error::InvalidVersion`] if the version is 0 or not greater than the current version
    ///  2. [`Error::IncompleteRow`] or [`Error::DuplicateInColumn`] if a row of `dlt` isn't
    ///     made of `depth` distinct nodes
    ///
    /// # Panics
    /// If `dlt` doesn't have the same width/depth as the current table
    #[instrument(level = "debug", skip(self, dlt, on_retired), fields(version = dlt.version()))]
    pub fn add<F>(&self, dlt: Dlt, on_retired: F) -> Result<Commit>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let version = dlt.version();
        if version == 0 {
            return Err(Error::InvalidVersion {
                version,
                reason: "version 0 is reserved".to_string(),
            });
        }
        dlt.verify(&dlt.nodes())?;

        let mut guard = self.acquire_lock()?;
        let inner = &mut *guard;
        if let Some(current) = inner.current_table() {
            if version <= current.version() {
                return Err(Error::InvalidVersion {
                    version,
                    reason: format!(
                        "new versions must be greater than the current version {}",
                        current.version()
                    ),
                });
            }
            assert!(
                current.width() == dlt.width() && current.depth() == dlt.depth(),
                "table lineage shape mismatch: current (width={}, depth={}), new (width={}, depth={})",
                current.width(),
                current.depth(),
                dlt.width(),
                dlt.depth()
            );
        }

        inner.tables.insert(version, Arc::new(dlt));
        let previous = inner.current.replace(version);

        let commit = match previous.and_then(|v| inner.tables.get(&v).cloned()) {
            Some(previous) if previous.refcount() > 0 => {
                event!(
                    Level::INFO,
                    "version {} is current, version {} still has {} leases",
                    version,
                    previous.version(),
                    previous.refcount()
                );
                inner
                    .callbacks
                    .insert(previous.version(), Box::new(on_retired));
                Commit::IoPending
            }
            _ => {
                event!(Level::INFO, "version {} is current", version);
                Commit::Done
            }
        };

        inner.check_size();
        Ok(commit)
    }

    /// Materializes `diff` against the current version and adds the result, see [`DltManager::add`]
    ///
    /// # Errors
    /// [`Error::InvalidVersion`] if the diff wasn't computed against the current version
    pub fn add_diff<F>(&self, diff: &DltDiff, on_retired: F) -> Result<Commit>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let current = self.current_version();
        if current != Some(diff.base_version()) {
            return Err(Error::InvalidVersion {
                version: diff.base_version(),
                reason: format!("diff base doesn't match the current version {:?}", current),
            });
        }

        self.add(diff.flatten(), on_retired)
    }

    /// Returns the current table and increments its refcount.
    /// The caller must give it back through [`DltManager::release`].
    ///
    /// # Errors
    /// [`Error::NotFound`] if no table was added yet
    pub fn get_current(&self) -> Result<Arc<Dlt>> {
        let guard = self.acquire_lock()?;
        let current = guard.current_table().ok_or(Error::NotFound {
            reason: "there is no current DLT".to_string(),
        })?;
        current.acquire();
        Ok(current)
    }

    /// Same as [`DltManager::get_current`] but the lease is released when the returned
    /// [`DltLease`] is dropped.
    pub fn lease_current(&self) -> Result<DltLease> {
        let dlt = self.get_current()?;
        Ok(DltLease {
            dlt,
            manager: self.clone(),
        })
    }

    /// Returns the given version without leasing it
    pub fn get_version(&self, version: u64) -> Option<Arc<Dlt>> {
        self.acquire_lock()
            .ok()
            .and_then(|guard| guard.tables.get(&version).cloned())
    }

    /// Gives back a lease obtained through [`DltManager::get_current`].
    ///
    /// If this was the last lease of a retired version, the callback registered when it was
    /// retired fires (outside of the manager's lock) and the version becomes eligible for
    /// eviction.
    ///
    /// # Errors
    ///  1. [`Error::InvalidVersion`] if `version` is 0
    ///  2. [`Error::NotFound`] if the version is unknown
    ///  3. [`Error::InvalidArgument`] if the version has no outstanding leases
    pub fn release(&self, version: u64) -> Result<()> {
        if version == 0 {
            return Err(Error::InvalidVersion {
                version,
                reason: "version 0 is reserved".to_string(),
            });
        }

        let callback = {
            let mut guard = self.acquire_lock()?;
            let dlt = guard.tables.get(&version).ok_or(Error::NotFound {
                reason: format!("DLT version {} is unknown", version),
            })?;

            match dlt.release() {
                None => {
                    return Err(Error::InvalidArgument {
                        reason: format!("DLT version {} has no outstanding leases", version),
                    });
                }
                Some(0) if guard.current != Some(version) => {
                    event!(Level::DEBUG, "last lease on retired version {} released", version);
                    let callback = guard.callbacks.remove(&version);
                    guard.check_size();
                    callback
                }
                Some(_) => None,
            }
        };

        if let Some(callback) = callback {
            callback(version);
        }

        Ok(())
    }

    /// Marks the current table as closed (acknowledged by every node)
    pub fn set_current_closed(&self) -> Result<()> {
        let guard = self.acquire_lock()?;
        let current = guard.current_table().ok_or(Error::NotFound {
            reason: "there is no current DLT".to_string(),
        })?;
        current.mark_closed();
        event!(Level::INFO, "version {} closed", current.version());
        Ok(())
    }

    /// Evicts the oldest retired, unleased versions until the history fits its bound.
    /// Returns how many versions were evicted.
    pub fn check_size(&self) -> Result<usize> {
        let mut guard = self.acquire_lock()?;
        Ok(guard.check_size())
    }

    pub fn current_version(&self) -> Option<u64> {
        self.acquire_lock().ok().and_then(|guard| guard.current)
    }

    /// Versions currently kept, oldest first
    pub fn versions(&self) -> Vec<u64> {
        self.acquire_lock()
            .map(|guard| guard.tables.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.acquire_lock()
            .map(|guard| guard.tables.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn current_table(&self) -> Option<Arc<Dlt>> {
        self.current.and_then(|v| self.tables.get(&v).cloned())
    }

    fn check_size(&mut self) -> usize {
        let mut evicted = 0;
        while self.tables.len() > self.max_tables {
            let candidate = self
                .tables
                .iter()
                .find(|(version, dlt)| Some(**version) != self.current && dlt.refcount() == 0)
                .map(|(version, _)| *version);

            match candidate {
                Some(version) => {
                    self.tables.remove(&version);
                    evicted += 1;
                    event!(Level::DEBUG, "evicted DLT version {}", version);
                }
                None => {
                    event!(
                        Level::DEBUG,
                        "{} versions kept (max {}), every stale version is still leased",
                        self.tables.len(),
                        self.max_tables
                    );
                    break;
                }
            }
        }

        evicted
    }
}

/// A lease on a [`Dlt`] that is released when dropped.
pub struct DltLease {
    dlt: Arc<Dlt>,
    manager: DltManager,
}

impl DltLease {
    pub fn dlt(&self) -> &Arc<Dlt> {
        &self.dlt
    }
}

impl Deref for DltLease {
    type Target = Dlt;

    fn deref(&self) -> &Self::Target {
        &self.dlt
    }
}

impl std::fmt::Debug for DltLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DltLease").field(&self.dlt).finish()
    }
}

impl Drop for DltLease {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release(self.dlt.version()) {
            event!(
                Level::WARN,
                "failed to release lease on version {}: {}",
                self.dlt.version(),
                err
            );
        }
    }
}
