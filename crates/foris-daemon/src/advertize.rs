//! Periodic advertisement notifications.
//!
//! Every [`ADVERTIZE_PERIOD`] the daemon publishes a `remote`/`advertize`
//! notification carrying its controller ID, hostname, netboot state and
//! module list. `started` is emitted exactly once per process lifetime,
//! `running` at the fixed cadence afterwards, and `exited` as the final
//! publish during orderly shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use foris_core::files::FileStore;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::Registry;

/// Fixed advertisement cadence.
pub const ADVERTIZE_PERIOD: Duration = Duration::from_secs(5);

/// Emitter of the advertisement stream.
pub struct Advertizer {
    registry: Arc<Registry>,
    files: FileStore,
    controller_id: String,
}

impl Advertizer {
    #[must_use]
    pub fn new(registry: Arc<Registry>, files: FileStore, controller_id: String) -> Self {
        Self {
            registry,
            files,
            controller_id,
        }
    }

    fn hostname(&self) -> String {
        self.files
            .read_to_string(Path::new("/proc/sys/kernel/hostname"))
            .map(|raw| raw.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Netboot state derived from the kernel command line.
    fn netboot(&self) -> &'static str {
        match self.files.read_to_string(Path::new("/proc/cmdline")) {
            Ok(cmdline) if cmdline.contains("nbrootfs") => "booted",
            Ok(_) => "unknown",
            Err(_) => "unknown",
        }
    }

    fn payload(&self, state: &str) -> Value {
        json!({
            "state": state,
            "id": self.controller_id,
            "hostname": self.hostname(),
            "netboot": self.netboot(),
            "modules": self.registry.modules(),
        })
    }

    /// Publish one advertisement with the given lifecycle state.
    pub fn publish(&self, state: &str) {
        self.registry
            .notify("remote", "advertize", self.payload(state));
    }

    /// Run the advertisement loop until `shutdown` flips, then emit the
    /// final `exited` advertisement.
    #[must_use]
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.publish("started");
            let mut ticker = tokio::time::interval(ADVERTIZE_PERIOD);
            // The first tick fires immediately; skip it, "started" just
            // went out.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.publish("running"),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            self.publish("exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use foris_core::locks::{LockBackend, LockRegistry};
    use foris_core::Message;

    use super::*;
    use crate::hub::SubscriptionFilter;
    use crate::modules;
    use crate::registry::Registry;
    use crate::state::{Backend, DaemonContext, MOCK_CONTROLLER_ID};

    fn mock_registry() -> (Arc<Registry>, Arc<DaemonContext>) {
        let context = DaemonContext::new(
            MOCK_CONTROLLER_ID.to_string(),
            Backend::Mock,
            false,
            LockBackend::InProcess,
        );
        let handlers = modules::build(&context, None).unwrap();
        let registry = Registry::new(
            handlers,
            context.hub.clone(),
            Arc::new(LockRegistry::new(LockBackend::InProcess)),
            false,
        )
        .unwrap();
        (Arc::new(registry), context)
    }

    fn assert_advertisement(message: &Message, state: &str) {
        assert_eq!(message.module, "remote");
        assert_eq!(message.action, "advertize");
        let data = message.data.as_ref().unwrap();
        assert_eq!(data["state"], state);
        assert_eq!(data["id"], MOCK_CONTROLLER_ID);
        assert!(data["hostname"].is_string());
        assert!(!data["modules"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_then_running_then_exited() {
        let (registry, context) = mock_registry();
        let sub = context.hub.subscribe(SubscriptionFilter::selected([(
            "remote",
            "advertize",
        )]));
        let advertizer = Advertizer::new(
            Arc::clone(&registry),
            FileStore::new(),
            MOCK_CONTROLLER_ID.to_string(),
        );
        advertizer.publish("started");
        advertizer.publish("running");
        advertizer.publish("exited");
        assert_advertisement(&sub.recv().await, "started");
        assert_advertisement(&sub.recv().await, "running");
        assert_advertisement(&sub.recv().await, "exited");
    }

    #[tokio::test]
    async fn loop_emits_started_and_exits_on_shutdown() {
        let (registry, context) = mock_registry();
        let sub = context
            .hub
            .subscribe(SubscriptionFilter::selected([("remote", "advertize")]));
        let (tx, rx) = watch::channel(false);
        let handle = Advertizer::new(
            Arc::clone(&registry),
            FileStore::new(),
            MOCK_CONTROLLER_ID.to_string(),
        )
        .spawn(rx);
        let first = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_advertisement(&first, "started");
        tx.send(true).unwrap();
        handle.await.unwrap();
        // Drain: the final message must be the exited advertisement.
        let mut last = None;
        while let Some(message) = sub.try_recv() {
            last = Some(message);
        }
        assert_advertisement(&last.expect("no final advertisement"), "exited");
    }
}
