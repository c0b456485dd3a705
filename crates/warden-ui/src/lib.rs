//! Restart-safe interactive message components.
//!
//! Callback closures cannot survive a process restart, so only
//! `(callback name, primitive args)` pairs are persisted; a process-wide
//! factory registry re-resolves them into live handlers at dispatch time.
//! The registry also reconciles its persisted view of which components hang
//! off which message against the chat platform's authoritative, possibly
//! externally-edited, view.

pub mod events;
pub mod registry;

pub use events::{GatewayEvent, InteractionEvent, MessageComponents};
pub use registry::{
    CallbackFactory, CallbackRegistry, Component, ComponentCallback, ComponentPresentation,
    ComponentStyle,
};
