//! Hook registry - typed publish/subscribe keyed by lifecycle event

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::types::{HookEvent, HookHandler, HookPayload};

/// A single hook subscription
#[derive(Clone)]
pub struct HookRegistration {
    pub plugin_id: String,
    pub event: HookEvent,
    pub handler: HookHandler,
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("plugin_id", &self.plugin_id)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Handlers per event, in registration order
#[derive(Debug, Default, Clone)]
pub struct HookRegistry {
    handlers: HashMap<HookEvent, Vec<HookRegistration>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to every listed event, tagged with `plugin_id`
    pub fn register(&mut self, plugin_id: &str, events: &[HookEvent], handler: &HookHandler) {
        for event in events {
            self.handlers
                .entry(*event)
                .or_default()
                .push(HookRegistration {
                    plugin_id: plugin_id.to_string(),
                    event: *event,
                    handler: handler.clone(),
                });
        }
    }

    /// Remove every registration owned by `plugin_id`, returning how many were removed
    pub fn remove_by_plugin(&mut self, plugin_id: &str) -> usize {
        let mut removed = 0;
        for registrations in self.handlers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.plugin_id != plugin_id);
            removed += before - registrations.len();
        }
        self.handlers.retain(|_, regs| !regs.is_empty());
        removed
    }

    #[must_use]
    pub fn has_handlers(&self, event: HookEvent) -> bool {
        self.handlers.get(&event).is_some_and(|regs| !regs.is_empty())
    }

    /// Copy of the handler list for `event`
    #[must_use]
    pub fn snapshot(&self, event: HookEvent) -> Vec<HookRegistration> {
        self.handlers.get(&event).cloned().unwrap_or_default()
    }

    /// All registrations, grouped by event in declaration order
    #[must_use]
    pub fn registered(&self) -> Vec<(HookEvent, String)> {
        HookEvent::ALL
            .into_iter()
            .flat_map(|event| {
                self.handlers
                    .get(&event)
                    .into_iter()
                    .flatten()
                    .map(move |r| (event, r.plugin_id.clone()))
            })
            .collect()
    }

    /// Whether any registration belongs to `plugin_id`
    #[must_use]
    pub fn has_plugin(&self, plugin_id: &str) -> bool {
        self.handlers
            .values()
            .flatten()
            .any(|r| r.plugin_id == plugin_id)
    }
}

/// Run a snapshot of handlers sequentially
///
/// Each handler is awaited before the next one starts. Errors and panics are
/// logged and swallowed so one failing handler never stops the rest.
pub async fn run_handlers(registrations: Vec<HookRegistration>, payload: &HookPayload) {
    let event = payload.event();

    for registration in registrations {
        // The handler call itself sits inside the guard: a closure may
        // panic before it ever returns a future
        let guarded = AssertUnwindSafe(async { (registration.handler)(payload.clone()).await });
        match guarded.catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    plugin_id = %registration.plugin_id,
                    event = %event,
                    error = %e,
                    "hook handler failed"
                );
            }
            Err(_) => {
                tracing::error!(
                    plugin_id = %registration.plugin_id,
                    event = %event,
                    "hook handler panicked"
                );
            }
        }
    }
}
