//! Component-to-message bookkeeping and interaction dispatch.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;
use warden_store::StoreHandle;

use crate::events::{GatewayEvent, InteractionEvent, MessageComponents};

#[async_trait]
/// A live handler produced by a factory for one persisted component.
pub trait ComponentCallback: Send + Sync {
    async fn invoke(&self, interaction: &InteractionEvent) -> Result<()>;
}

/// Builds a [`ComponentCallback`] from the primitive args that survived a
/// restart. Registered once per name at startup.
pub trait CallbackFactory: Send + Sync {
    fn build(&self, args: &[Value]) -> Result<Box<dyn ComponentCallback>>;
}

impl<F> CallbackFactory for F
where
    F: Fn(&[Value]) -> Result<Box<dyn ComponentCallback>> + Send + Sync,
{
    fn build(&self, args: &[Value]) -> Result<Box<dyn ComponentCallback>> {
        self(args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported component render styles.
pub enum ComponentStyle {
    Primary,
    Success,
    Danger,
    Link,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// How a component is rendered, independent of its routing.
pub struct ComponentPresentation {
    pub label: String,
    pub style: ComponentStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An interactive UI element ready to attach to an outgoing message.
///
/// Registry-created components carry their routing id in `component_id`;
/// plain URL components carry none and never enter the registry.
pub struct Component {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    pub presentation: ComponentPresentation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Component {
    pub fn link(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            component_id: None,
            presentation: ComponentPresentation {
                label: label.into(),
                style: ComponentStyle::Link,
                emoji: None,
            },
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AttachedComponent {
    component_id: String,
    callback_name: String,
    callback_args: Vec<Value>,
}

#[derive(Debug, Clone)]
struct PendingComponent {
    callback_name: String,
    callback_args: Vec<Value>,
}

/// Routes component interactions to named callback factories and keeps the
/// component-to-message mapping persistent across restarts.
pub struct CallbackRegistry {
    bot_user_id: String,
    factories: Mutex<HashMap<String, Arc<dyn CallbackFactory>>>,
    // Lock order: `pending` before `attached` wherever both are held.
    pending: Mutex<HashMap<String, PendingComponent>>,
    attached: StoreHandle,
}

impl CallbackRegistry {
    pub fn new(bot_user_id: impl Into<String>, attached: StoreHandle) -> Self {
        Self {
            bot_user_id: bot_user_id.into(),
            factories: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            attached,
        }
    }

    /// Registers a factory under a process-wide unique name.
    pub fn register_callback_factory(
        &self,
        name: &str,
        factory: Arc<dyn CallbackFactory>,
    ) -> Result<()> {
        let mut factories = self
            .factories
            .lock()
            .map_err(|_| anyhow!("factory registry mutex is poisoned"))?;
        if factories.contains_key(name) {
            bail!("callback '{name}' is already registered");
        }
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Creates a component routed to `callback_name` with the given persisted
    /// args. The component id is fresh across both pending and attached ids.
    ///
    /// Args must be JSON primitives: anything richer could not faithfully
    /// survive a restart and is rejected up front.
    pub fn create_component(
        &self,
        callback_name: &str,
        callback_args: Vec<Value>,
        presentation: ComponentPresentation,
    ) -> Result<Component> {
        {
            let factories = self
                .factories
                .lock()
                .map_err(|_| anyhow!("factory registry mutex is poisoned"))?;
            if !factories.contains_key(callback_name) {
                bail!("callback '{callback_name}' is not registered");
            }
        }
        for arg in &callback_args {
            if arg.is_object() || arg.is_array() {
                bail!("callback args must be JSON primitives, got {arg}");
            }
        }

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("pending component mutex is poisoned"))?;
        let component_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if pending.contains_key(&candidate) || self.is_attached(&candidate)? {
                continue;
            }
            break candidate;
        };
        pending.insert(
            component_id.clone(),
            PendingComponent {
                callback_name: callback_name.to_string(),
                callback_args,
            },
        );

        Ok(Component {
            component_id: Some(component_id),
            presentation,
            url: None,
        })
    }

    fn is_attached(&self, component_id: &str) -> Result<bool> {
        self.attached.with(|map| {
            map.values().any(|list| {
                list.as_array().is_some_and(|rows| {
                    rows.iter()
                        .any(|row| row.get("component_id").and_then(Value::as_str) == Some(component_id))
                })
            })
        })
    }

    /// Routes one gateway event. `member_joined` is a feature-module concern
    /// and is ignored here.
    pub async fn handle_event(&self, event: &GatewayEvent) -> Result<()> {
        match event {
            GatewayEvent::MessageSent(message) => self.handle_message_sent(message),
            GatewayEvent::MessageEdited(message) => self.handle_message_edited(message),
            GatewayEvent::MessageDeleted { message_id } => self.handle_message_deleted(message_id),
            GatewayEvent::MessagesBulkDeleted { message_ids } => {
                for message_id in message_ids {
                    self.handle_message_deleted(message_id)?;
                }
                Ok(())
            }
            GatewayEvent::ComponentInteraction(interaction) => self.dispatch(interaction).await,
            GatewayEvent::MemberJoined { .. } => Ok(()),
        }
    }

    /// Promotes pending components observed on one of our outgoing messages.
    ///
    /// An id with no pending registration is an integrity anomaly: it is
    /// logged and ignored, never adopted, so an attacker-controlled component
    /// can never reach a handler.
    pub fn handle_message_sent(&self, message: &MessageComponents) -> Result<()> {
        if message.author_id != self.bot_user_id || message.component_ids.is_empty() {
            return Ok(());
        }

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("pending component mutex is poisoned"))?;
        self.attached.with(|map| {
            let mut rows = decode_attached_rows(map.get(&message.message_id));
            for component_id in &message.component_ids {
                match pending.remove(component_id) {
                    Some(entry) => rows.push(AttachedComponent {
                        component_id: component_id.clone(),
                        callback_name: entry.callback_name,
                        callback_args: entry.callback_args,
                    }),
                    None => tracing::warn!(
                        component_id = %component_id,
                        message_id = %message.message_id,
                        "observed component was never registered as pending"
                    ),
                }
            }
            if !rows.is_empty() {
                map.insert(message.message_id.clone(), encode_attached_rows(&rows));
            }
        })
    }

    /// Reconciles against the full new component set of an edited message.
    ///
    /// Ids that disappeared are detached; ids that newly appear are promoted
    /// from pending exactly as in the send case. A bare reappearance of a
    /// previously-removed id has no pending entry and is not re-attached.
    pub fn handle_message_edited(&self, message: &MessageComponents) -> Result<()> {
        if message.author_id != self.bot_user_id {
            return Ok(());
        }

        let incoming: HashSet<&str> = message.component_ids.iter().map(String::as_str).collect();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("pending component mutex is poisoned"))?;
        self.attached.with(|map| {
            let mut rows = decode_attached_rows(map.get(&message.message_id));
            rows.retain(|row| incoming.contains(row.component_id.as_str()));
            let present: HashSet<String> =
                rows.iter().map(|row| row.component_id.clone()).collect();

            for component_id in &message.component_ids {
                if present.contains(component_id) {
                    continue;
                }
                match pending.remove(component_id) {
                    Some(entry) => rows.push(AttachedComponent {
                        component_id: component_id.clone(),
                        callback_name: entry.callback_name,
                        callback_args: entry.callback_args,
                    }),
                    None => tracing::warn!(
                        component_id = %component_id,
                        message_id = %message.message_id,
                        "edited-in component was never registered as pending"
                    ),
                }
            }

            if rows.is_empty() {
                map.remove(&message.message_id);
            } else {
                map.insert(message.message_id.clone(), encode_attached_rows(&rows));
            }
        })
    }

    /// Drops every component attached to a deleted message; no further
    /// dispatch is possible for them.
    pub fn handle_message_deleted(&self, message_id: &str) -> Result<()> {
        self.attached.with(|map| {
            map.remove(message_id);
        })
    }

    /// Dispatches an interaction to the matching component's handler.
    ///
    /// Stale or foreign interactions (unknown message, unknown component,
    /// bot-authored press, message not ours) are silent no-ops rather than
    /// errors: the user may be pressing a button that outlived its state.
    pub async fn dispatch(&self, interaction: &InteractionEvent) -> Result<()> {
        if interaction.user_is_bot || interaction.message_author_id != self.bot_user_id {
            return Ok(());
        }

        let Some((callback_name, callback_args)) = self.attached.with(|map| {
            decode_attached_rows(map.get(&interaction.message_id))
                .into_iter()
                .find(|row| row.component_id == interaction.component_id)
                .map(|row| (row.callback_name, row.callback_args))
        })?
        else {
            return Ok(());
        };

        let factory = {
            let factories = self
                .factories
                .lock()
                .map_err(|_| anyhow!("factory registry mutex is poisoned"))?;
            factories.get(&callback_name).cloned()
        };
        let Some(factory) = factory else {
            // startup reconciliation should have pruned this entry
            tracing::warn!(
                callback = %callback_name,
                component_id = %interaction.component_id,
                "no live factory for persisted component, not dispatching"
            );
            return Ok(());
        };

        // No registry lock is held across the await: the handler may itself
        // create components or edit messages.
        let handler = factory.build(&callback_args)?;
        handler.invoke(interaction).await
    }

    /// Startup pass: drops persisted components whose callback name has no
    /// live factory, and malformed rows, before any gateway event is served.
    pub fn reconcile_persisted(&self) -> Result<()> {
        let factories = self
            .factories
            .lock()
            .map_err(|_| anyhow!("factory registry mutex is poisoned"))?;
        let survivors = self.attached.with(|map| {
            let message_ids = map.keys().cloned().collect::<Vec<_>>();
            let mut kept = 0_usize;
            for message_id in message_ids {
                let rows = decode_attached_rows(map.get(&message_id));
                let retained = rows
                    .into_iter()
                    .filter(|row| {
                        if factories.contains_key(&row.callback_name) {
                            true
                        } else {
                            tracing::warn!(
                                callback = %row.callback_name,
                                component_id = %row.component_id,
                                message_id = %message_id,
                                "dropping persisted component with no live factory"
                            );
                            false
                        }
                    })
                    .collect::<Vec<_>>();
                if retained.is_empty() {
                    map.remove(&message_id);
                } else {
                    kept += retained.len();
                    map.insert(message_id, encode_attached_rows(&retained));
                }
            }
            kept
        })?;
        tracing::info!(components = survivors, "reconciled persisted components");
        Ok(())
    }
}

fn decode_attached_rows(value: Option<&Value>) -> Vec<AttachedComponent> {
    let Some(rows) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match serde_json::from_value(row.clone()) {
            Ok(component) => Some(component),
            Err(error) => {
                tracing::warn!(%error, "dropping malformed persisted component row");
                None
            }
        })
        .collect()
}

fn encode_attached_rows(rows: &[AttachedComponent]) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                json!({
                    "component_id": row.component_id,
                    "callback_name": row.callback_name,
                    "callback_args": row.callback_args,
                })
            })
            .collect(),
    )
}
