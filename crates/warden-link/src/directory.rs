//! Durable membership records: who has linked which external identities.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_store::StoreHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One known community member, keyed by institutional email.
pub struct MemberRecord {
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_host_login: Option<String>,
}

#[async_trait]
/// Lookup and mutation of durable membership state.
pub trait MemberDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<MemberRecord>>;

    async fn find_by_chat_id(&self, chat_id: &str) -> Result<Option<MemberRecord>>;

    /// Records that `email`'s owner is the given chat user.
    async fn link_chat_identity(&self, email: &str, chat_id: &str) -> Result<()>;

    /// Records the code-host login for a chat user. The record is created on
    /// the fly for users with no directory identity (guests and alumni).
    async fn link_code_host(&self, chat_id: &str, login: &str, name: &str) -> Result<()>;

    async fn code_host_login(&self, chat_id: &str) -> Result<Option<String>>;
}

/// [`MemberDirectory`] persisted through a registered store, one JSON record
/// per email key.
pub struct StoreBackedDirectory {
    store: StoreHandle,
}

impl StoreBackedDirectory {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Seeds a record for an email that has not linked anything yet.
    pub fn insert_member(&self, email: &str, name: &str) -> Result<()> {
        let record = MemberRecord {
            email: email.to_string(),
            name: name.to_string(),
            chat_id: None,
            code_host_login: None,
        };
        self.store.with(|map| {
            map.insert(email.to_string(), record_to_value(&record));
        })
    }
}

fn record_to_value(record: &MemberRecord) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

fn decode_record(value: &Value) -> Option<MemberRecord> {
    match serde_json::from_value(value.clone()) {
        Ok(record) => Some(record),
        Err(error) => {
            tracing::warn!(%error, "skipping malformed member record");
            None
        }
    }
}

#[async_trait]
impl MemberDirectory for StoreBackedDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<MemberRecord>> {
        self.store.with(|map| map.get(email).and_then(decode_record))
    }

    async fn find_by_chat_id(&self, chat_id: &str) -> Result<Option<MemberRecord>> {
        self.store.with(|map| {
            map.values()
                .filter_map(decode_record)
                .find(|record| record.chat_id.as_deref() == Some(chat_id))
        })
    }

    async fn link_chat_identity(&self, email: &str, chat_id: &str) -> Result<()> {
        self.store.with(|map| {
            if let Some(mut record) = map.get(email).and_then(decode_record) {
                record.chat_id = Some(chat_id.to_string());
                map.insert(email.to_string(), record_to_value(&record));
            }
        })
    }

    async fn link_code_host(&self, chat_id: &str, login: &str, name: &str) -> Result<()> {
        self.store.with(|map| {
            let existing_key = map
                .iter()
                .find(|(_, value)| {
                    decode_record(value)
                        .is_some_and(|record| record.chat_id.as_deref() == Some(chat_id))
                })
                .map(|(key, _)| key.clone());
            match existing_key {
                Some(key) => {
                    if let Some(mut record) = map.get(&key).and_then(decode_record) {
                        record.code_host_login = Some(login.to_string());
                        map.insert(key, record_to_value(&record));
                    }
                }
                None => {
                    let record = MemberRecord {
                        email: format!("chat:{chat_id}"),
                        name: name.to_string(),
                        chat_id: Some(chat_id.to_string()),
                        code_host_login: Some(login.to_string()),
                    };
                    map.insert(record.email.clone(), record_to_value(&record));
                }
            }
        })
    }

    async fn code_host_login(&self, chat_id: &str) -> Result<Option<String>> {
        Ok(self
            .find_by_chat_id(chat_id)
            .await?
            .and_then(|record| record.code_host_login))
    }
}
