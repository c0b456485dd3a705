//! Disk-backed named key-value stores with periodic snapshotting.
//!
//! Each registered store is one JSON object persisted 1:1 to a file named
//! after the store. Callers mutate the live map through the returned handle;
//! a flush pass runs every registered store's maintenance hook and rewrites
//! its backing file atomically.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use tokio::sync::watch;
use warden_core::write_json_atomic;

/// Flush cadence used when no override is configured.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(300);

/// Hook run on the live map immediately before each snapshot is written.
pub type MaintenanceHook = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

#[derive(Clone, Debug)]
/// Shared reference to the live map of one registered store.
///
/// The handle points at the exact map that is flushed to disk; there is no
/// separate "set" API. All access goes through [`StoreHandle::with`] so the
/// map is never touched without its lock.
pub struct StoreHandle {
    data: Arc<Mutex<Map<String, Value>>>,
}

impl StoreHandle {
    pub fn with<R>(&self, access: impl FnOnce(&mut Map<String, Value>) -> R) -> Result<R> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| anyhow!("store mutex is poisoned"))?;
        Ok(access(&mut data))
    }

    pub fn len(&self) -> Result<usize> {
        self.with(|data| data.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with(|data| data.is_empty())
    }
}

struct RegisteredStore {
    name: String,
    path: PathBuf,
    maintenance: Option<MaintenanceHook>,
    handle: StoreHandle,
}

/// Owns every registered store and writes the snapshots.
pub struct StoreManager {
    storage_dir: PathBuf,
    stores: Mutex<Vec<RegisteredStore>>,
}

impl StoreManager {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            stores: Mutex::new(Vec::new()),
        }
    }

    /// Loads the backing file for `name` (missing file means empty store) and
    /// returns the handle that will be mutated and flushed from now on.
    ///
    /// A present-but-unparsable file is an error: corrupt persisted state must
    /// not be silently discarded, and the binary treats this as fatal at
    /// startup.
    pub fn register(&self, name: &str, maintenance: Option<MaintenanceHook>) -> Result<StoreHandle> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("store name '{name}' must be non-empty [a-zA-Z0-9_]");
        }

        let mut stores = self
            .stores
            .lock()
            .map_err(|_| anyhow!("store registry mutex is poisoned"))?;
        if stores.iter().any(|store| store.name == name) {
            bail!("store '{name}' is already registered");
        }

        let path = self.storage_dir.join(format!("{name}.json"));
        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store file {}", path.display()))?;
            let parsed = serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("failed to parse store file {}", path.display()))?;
            match parsed {
                Value::Object(map) => map,
                _ => bail!(
                    "store file {} must contain a single JSON object",
                    path.display()
                ),
            }
        } else {
            Map::new()
        };

        tracing::info!(store = name, records = data.len(), "loaded persistent store");

        let handle = StoreHandle {
            data: Arc::new(Mutex::new(data)),
        };
        stores.push(RegisteredStore {
            name: name.to_string(),
            path,
            maintenance,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Runs every store's maintenance hook and rewrites its backing file.
    ///
    /// A failed write leaves the previous snapshot stale until the next
    /// successful flush; it is logged and never aborts the pass.
    pub fn flush_all(&self) {
        let stores = match self.stores.lock() {
            Ok(stores) => stores,
            Err(_) => {
                tracing::error!("store registry mutex is poisoned, skipping flush");
                return;
            }
        };
        for store in stores.iter() {
            if let Err(error) = flush_store(store) {
                tracing::error!(store = %store.name, %error, "failed to flush store");
            }
        }
    }
}

fn flush_store(store: &RegisteredStore) -> Result<()> {
    let snapshot = store.handle.with(|data| {
        if let Some(hook) = &store.maintenance {
            hook(data);
        }
        data.clone()
    })?;
    let records = snapshot.len();
    write_json_atomic(&store.path, &Value::Object(snapshot))?;
    tracing::info!(store = %store.name, records, "saved persistent store");
    Ok(())
}

/// Flushes all stores on a fixed interval until shutdown is signalled, then
/// runs one final unconditional flush.
///
/// The final flush also runs when the timer is interrupted mid-wait, so a
/// graceful shutdown never loses the last window of mutations.
pub async fn run_flush_loop(
    manager: Arc<StoreManager>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.flush_all();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && !*shutdown_rx.borrow() {
                    continue;
                }
                manager.flush_all();
                break;
            }
        }
    }
}
