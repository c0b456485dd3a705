//! TTL-bounded, single-claim correlation flows for redirect callbacks.
//!
//! A flow entry correlates an externally-initiated provider redirect back to
//! the user and in-flight authorization context that started it. Entries live
//! inside a persistent store so an in-progress linking attempt survives a
//! process restart, and are pruned once they outlive the 24-hour window.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use warden_core::{current_unix_timestamp, is_older_than};
use warden_store::{MaintenanceHook, StoreHandle};

/// Window during which a minted correlation token stays claimable.
pub const FLOW_TTL_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One pending flow: who started it, when, and the provider-specific context.
pub struct FlowEntry {
    pub created_at: u64,
    pub owner_id: String,
    pub context: Value,
}

impl FlowEntry {
    fn to_value(&self) -> Value {
        json!({
            "created_at": self.created_at,
            "owner_id": self.owner_id,
            "context": self.context,
        })
    }
}

/// Source of correlation tokens. Injected so tests can script collisions.
pub trait TokenSource: Send + Sync {
    fn issue(&self) -> String;
}

#[derive(Debug, Default)]
/// Default token source: random v4 UUID rendered as bare hex.
pub struct UuidTokenSource;

impl TokenSource for UuidTokenSource {
    fn issue(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Tracks one family of pending flows inside a persistent store.
///
/// The caller registers the backing store with [`FlowTracker::maintenance_hook`]
/// so expired entries are pruned right before every snapshot.
pub struct FlowTracker {
    store: StoreHandle,
    tokens: Arc<dyn TokenSource>,
}

impl FlowTracker {
    pub fn new(store: StoreHandle) -> Self {
        Self::with_token_source(store, Arc::new(UuidTokenSource))
    }

    pub fn with_token_source(store: StoreHandle, tokens: Arc<dyn TokenSource>) -> Self {
        Self { store, tokens }
    }

    /// Pre-save hook for the store backing a tracker.
    pub fn maintenance_hook() -> MaintenanceHook {
        Arc::new(prune_expired)
    }

    /// Inserts a new entry under a token that is unique among currently-live
    /// keys and returns the token.
    ///
    /// A collision is vanishingly unlikely but is handled by regeneration,
    /// never assumed impossible.
    pub fn mint(&self, owner_id: &str, context: Value) -> Result<String> {
        let entry = FlowEntry {
            created_at: current_unix_timestamp(),
            owner_id: owner_id.to_string(),
            context,
        };
        self.store.with(|entries| {
            loop {
                let token = self.tokens.issue();
                if entries.contains_key(&token) {
                    continue;
                }
                entries.insert(token.clone(), entry.to_value());
                return token;
            }
        })
    }

    /// Looks an entry up by token without deleting it.
    ///
    /// Deletion is the caller's responsibility via [`FlowTracker::discard`];
    /// the linking services discard on the first claim attempt, success or
    /// failure alike, because the provider-issued code in `context` is
    /// single-use either way.
    pub fn claim(&self, token: &str) -> Result<Option<FlowEntry>> {
        self.store.with(|entries| {
            entries
                .get(token)
                .and_then(|value| serde_json::from_value(value.clone()).ok())
        })
    }

    /// Removes the entry for `token`; returns whether it was present.
    pub fn discard(&self, token: &str) -> Result<bool> {
        self.store.with(|entries| entries.remove(token).is_some())
    }
}

/// Removes every entry that has outlived [`FLOW_TTL_SECONDS`], regardless of
/// claim state. Unparsable entries are dropped too.
///
/// Collects doomed keys first, then deletes: the map is never mutated while
/// it is being iterated.
pub fn prune_expired(entries: &mut Map<String, Value>) {
    let now = current_unix_timestamp();
    let doomed = entries
        .iter()
        .filter_map(|(token, value)| {
            match serde_json::from_value::<FlowEntry>(value.clone()) {
                Ok(entry) if !is_older_than(entry.created_at, FLOW_TTL_SECONDS, now) => None,
                Ok(_) => Some(token.clone()),
                Err(error) => {
                    tracing::warn!(%error, "dropping unparsable flow entry");
                    Some(token.clone())
                }
            }
        })
        .collect::<Vec<_>>();
    for token in doomed {
        entries.remove(&token);
    }
}
