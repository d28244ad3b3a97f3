//! Command → service routing and event-bus glue (§4.11.1 supplemental, narrowly scoped).
//!
//! Grounded in `original_source/huddle_chat/controller.py`'s dispatch table shape, minus
//! its help/onboarding text (out of scope per §1 Non-goals). Dispatch here is over
//! already-tokenized command names; slash-command parsing itself lives in the external TUI.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event_bus::{ControllerEvent, EventBus};

/// A dispatchable command handler. Returns a human-readable result line, or an error
/// string the caller surfaces as a system message.
pub type CommandHandler = Arc<dyn Fn(&[String]) -> Result<String, String> + Send + Sync>;

/// Routes literal, already-tokenized command names to handler closures over the core
/// services, and publishes [`ControllerEvent`]s with a synchronous fallback when the bus
/// can't take them (§4.11.1).
pub struct CommandRouter {
    handlers: HashMap<String, CommandHandler>,
    event_bus: Arc<EventBus>,
}

impl CommandRouter {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self { handlers: HashMap::new(), event_bus }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: CommandHandler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Dispatches `name args...` to its registered handler. Unknown commands are reported
    /// as an error rather than panicking — the controller never assumes the TUI pre-validated
    /// the command table.
    pub fn dispatch(&self, name: &str, args: &[String]) -> Result<String, String> {
        let handler = self.handlers.get(name).ok_or_else(|| format!("unknown command '{name}'"))?;
        handler(args)
    }

    /// Publishes a refresh-style event, falling back to running `fallback` synchronously if
    /// the bus reports no handler accepted it (§4.11.1: "synchronous fallback path").
    pub async fn publish_or_fallback(&self, event: ControllerEvent, critical: bool, fallback: impl FnOnce()) {
        let delivered = self.event_bus.publish(event, critical).await;
        if !delivered {
            fallback();
        }
    }
}
