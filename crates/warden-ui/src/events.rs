//! Gateway event model: what the chat platform reports to the core.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message together with the full set of interactive component ids the
/// platform currently renders on it.
pub struct MessageComponents {
    pub message_id: String,
    pub author_id: String,
    #[serde(default)]
    pub component_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A user pressing one interactive component on one message.
pub struct InteractionEvent {
    pub message_id: String,
    pub message_author_id: String,
    pub component_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_is_bot: bool,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Inbound gateway notifications, keyed by message and/or component id.
///
/// `message_edited` always carries the message's full new component-id set:
/// the platform allows a message's components to be replaced out-of-band, so
/// the attached set is reconciled, never assumed immutable.
pub enum GatewayEvent {
    MessageSent(MessageComponents),
    MessageEdited(MessageComponents),
    MessageDeleted { message_id: String },
    MessagesBulkDeleted { message_ids: Vec<String> },
    ComponentInteraction(InteractionEvent),
    MemberJoined { user_id: String },
}
