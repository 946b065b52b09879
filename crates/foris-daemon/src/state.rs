//! Shared daemon context.
//!
//! One [`DaemonContext`] is built at startup and handed to every module
//! handler. It bundles the ambient services (locks, config store client,
//! file store, service runner, async runtime, notification hub) plus the
//! node identity; the context itself is immutable after construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use foris_core::async_cmd::{AsyncCommandRuntime, NotifySink, TaskEvent};
use foris_core::files::FileStore;
use foris_core::locks::{LockBackend, LockRegistry};
use foris_core::services::ServiceRunner;
use foris_core::uci::UciClient;
use foris_core::Message;
use serde_json::{json, Value};

use crate::hub::NotificationHub;

/// Controller ID reported by the mock backend.
pub const MOCK_CONTROLLER_ID: &str = "0000000a0000000b";

/// Handler variant, chosen once at startup; switching requires restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Real uci store, init scripts and hardware.
    Openwrt,
    /// In-memory state for tests and development hosts.
    Mock,
}

/// Explicit state store for mock handlers, keyed by module name.
///
/// Replaces the original design's process-wide shared-state manager: one
/// JSON value per module behind a plain mutex, reachable from every
/// worker through the shared context.
#[derive(Default)]
pub struct MockStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MockStore {
    /// Current value for `module`, or `{}` when nothing was stored yet.
    #[must_use]
    pub fn get(&self, module: &str) -> Value {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    /// Mutate `module`'s value in place.
    pub fn update(&self, module: &str, mutate: impl FnOnce(&mut Value)) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let entry = values
            .entry(module.to_string())
            .or_insert_with(|| json!({}));
        mutate(entry);
    }
}

/// Ambient services shared by all handlers.
pub struct DaemonContext {
    pub controller_id: String,
    pub backend: Backend,
    pub debug: bool,
    pub locks: Arc<LockRegistry>,
    pub hub: NotificationHub,
    pub tasks: AsyncCommandRuntime,
    pub uci: UciClient,
    pub files: FileStore,
    pub services: ServiceRunner,
    pub mock: MockStore,
}

impl DaemonContext {
    /// Assemble the context. The async runtime's notification sink is
    /// wired straight into the hub so task progress events become
    /// ordinary notifications.
    #[must_use]
    pub fn new(
        controller_id: String,
        backend: Backend,
        debug: bool,
        lock_backend: LockBackend,
    ) -> Arc<Self> {
        Self::with_files(controller_id, backend, debug, lock_backend, FileStore::new())
    }

    /// Context with an explicit file store root; tests point this at a
    /// sandbox directory instead of mutating the process environment.
    #[must_use]
    pub fn with_files(
        controller_id: String,
        backend: Backend,
        debug: bool,
        lock_backend: LockBackend,
        files: FileStore,
    ) -> Arc<Self> {
        let locks = Arc::new(LockRegistry::new(lock_backend));
        let hub = NotificationHub::new();
        let sink = task_event_sink(hub.clone());
        let tasks = AsyncCommandRuntime::new(sink, None);
        Arc::new(Self {
            controller_id,
            backend,
            debug,
            locks: Arc::clone(&locks),
            hub,
            tasks,
            uci: UciClient::new(),
            files,
            services: ServiceRunner::new(locks),
            mock: MockStore::default(),
        })
    }
}

/// Notification sink translating task events into envelopes on the hub.
#[must_use]
pub fn task_event_sink(hub: NotificationHub) -> NotifySink {
    Arc::new(move |event: TaskEvent| {
        hub.publish(&Message::notification(
            &event.origin.module,
            &event.origin.action,
            Some(json!({
                "task_id": event.task_id,
                "status": event.status,
            })),
        ));
        Ok(())
    })
}
