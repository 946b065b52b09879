//! Pub/sub broker transport.
//!
//! Every node owns the topic namespace `controller/<id>/…`:
//!
//! - requests arrive on `controller/<id>/request/<module>/<action>` with
//!   payload `{"reply_msg_id": "<uuid>", "data": …}`; the reply envelope
//!   is published to `controller/<id>/reply/<reply_msg_id>`
//! - notifications go out on
//!   `controller/<id>/notification/<module>/<action>`
//! - introspection topics `…/list`, `…/jsonschemas`,
//!   `…/request/<module>/list` and `…/working_replies` answer the
//!   registry queries over the broker
//!
//! The node keeps a *working replies* set of outstanding
//! `reply_msg_id`s so a reconnecting client can discover which of its
//! requests are still in flight. A request for an unknown module on
//! this node answers `list` introspection with an empty list; requests
//! addressed to unknown node IDs are simply never seen here and time
//! out on the client.
//!
//! When the topic tail of a request matches a declared action the frame
//! dispatches as a request, even if that action is named `list`;
//! otherwise a `list` tail answers the module's action listing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foris_core::Message;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::hub::SubscriptionFilter;
use crate::registry::Registry;

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub controller_id: String,
}

/// Queries addressed to this node over the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InboundQuery {
    /// `controller/<id>/list`
    List,
    /// `controller/<id>/jsonschemas`
    Schemas,
    /// `controller/<id>/working_replies`
    WorkingReplies,
    /// `controller/<id>/request/<module>/<action>` (including the
    /// `<module>/list` introspection form; resolution against declared
    /// actions happens at handling time).
    ModuleAction { module: String, action: String },
}

/// Parse a subscribed topic back into a query.
fn parse_topic(controller_id: &str, topic: &str) -> Option<InboundQuery> {
    let rest = topic.strip_prefix(&format!("controller/{controller_id}/"))?;
    match rest {
        "list" => Some(InboundQuery::List),
        "jsonschemas" => Some(InboundQuery::Schemas),
        "working_replies" => Some(InboundQuery::WorkingReplies),
        _ => {
            let request = rest.strip_prefix("request/")?;
            let (module, action) = request.split_once('/')?;
            if module.is_empty() || action.is_empty() || action.contains('/') {
                return None;
            }
            Some(InboundQuery::ModuleAction {
                module: module.to_string(),
                action: action.to_string(),
            })
        }
    }
}

/// Outstanding `reply_msg_id`s, shared with the advertisement of
/// in-flight work.
#[derive(Clone, Default)]
pub struct WorkingReplies {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl WorkingReplies {
    fn begin(&self, reply_msg_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reply_msg_id.to_string());
    }

    fn finish(&self, reply_msg_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(reply_msg_id);
    }

    /// Snapshot of the outstanding ids, sorted for stable output.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

fn reply_topic(controller_id: &str, reply_msg_id: &str) -> String {
    format!("controller/{controller_id}/reply/{reply_msg_id}")
}

fn notification_topic(controller_id: &str, message: &Message) -> String {
    format!(
        "controller/{controller_id}/notification/{}/{}",
        message.module, message.action
    )
}

/// Serve the broker binding until `shutdown` flips.
///
/// `single` caps dispatch to one in-flight request, mirroring the
/// single-worker mode of the bus deployments.
pub async fn serve(
    config: MqttConfig,
    registry: Arc<Registry>,
    single: bool,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut options = MqttOptions::new(
        format!("foris-controller-{}", config.controller_id),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let working = WorkingReplies::default();

    // Notifications: one hub subscription forwarded to the broker for
    // the life of the binding.
    {
        let forward_client = client.clone();
        let controller_id = config.controller_id.clone();
        let subscription = registry.hub().subscribe(SubscriptionFilter::All);
        let mut forward_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.recv() => {
                        let topic = notification_topic(&controller_id, &message);
                        let Ok(payload) = message.to_vec() else { continue };
                        if let Err(error) = forward_client
                            .publish(topic, QoS::AtLeastOnce, false, payload)
                            .await
                        {
                            debug!(%error, "notification publish failed");
                        }
                    }
                    changed = forward_shutdown.changed() => {
                        if changed.is_err() || *forward_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    info!(host = %config.host, port = config.port, "mqtt transport connecting");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // (Re)connected: subscriptions do not survive the
                    // session, re-establish them.
                    let prefix = format!("controller/{}", config.controller_id);
                    for topic in [
                        format!("{prefix}/request/+/+"),
                        format!("{prefix}/list"),
                        format!("{prefix}/jsonschemas"),
                        format!("{prefix}/working_replies"),
                    ] {
                        if let Err(error) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            warn!(%error, "subscribe failed");
                        }
                    }
                    info!("mqtt transport connected");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let registry = Arc::clone(&registry);
                    let client = client.clone();
                    let working = working.clone();
                    let controller_id = config.controller_id.clone();
                    let task = async move {
                        handle_publish(&controller_id, &registry, &client, &working, publish)
                            .await;
                    };
                    if single {
                        task.await;
                    } else {
                        tokio::spawn(task);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "mqtt connection error; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    info!("mqtt transport stopped");
    Ok(())
}

async fn handle_publish(
    controller_id: &str,
    registry: &Registry,
    client: &AsyncClient,
    working: &WorkingReplies,
    publish: Publish,
) {
    let Some(query) = parse_topic(controller_id, &publish.topic) else {
        debug!(topic = %publish.topic, "ignoring unrelated topic");
        return;
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&publish.payload) else {
        warn!(topic = %publish.topic, "request payload is not JSON");
        return;
    };
    let Some(reply_msg_id) = payload.get("reply_msg_id").and_then(Value::as_str) else {
        warn!(topic = %publish.topic, "request payload lacks reply_msg_id");
        return;
    };
    let reply_msg_id = reply_msg_id.to_string();

    working.begin(&reply_msg_id);
    let response: Value = match query {
        InboundQuery::List => {
            json!(registry
                .modules()
                .iter()
                .map(|name| json!({
                    "name": name,
                    "actions": registry.actions(name).unwrap_or_default(),
                }))
                .collect::<Vec<_>>())
        }
        InboundQuery::Schemas => registry.schemas().clone(),
        InboundQuery::WorkingReplies => json!({ "working_replies": working.snapshot() }),
        InboundQuery::ModuleAction { module, action } => {
            let declared = registry
                .actions(&module)
                .is_some_and(|actions| actions.contains(&action.as_str()));
            if !declared && action == "list" {
                // Module action listing; an unknown module answers with
                // an empty list rather than an error.
                json!(registry.actions(&module).unwrap_or_default())
            } else {
                let message =
                    Message::request(&module, &action, payload.get("data").cloned());
                match serde_json::to_value(registry.dispatch(message).await) {
                    Ok(value) => value,
                    Err(error) => {
                        warn!(%error, "reply serialization failed");
                        working.finish(&reply_msg_id);
                        return;
                    }
                }
            }
        }
    };

    let topic = reply_topic(controller_id, &reply_msg_id);
    if let Err(error) = client
        .publish(topic, QoS::AtLeastOnce, false, response.to_string())
        .await
    {
        warn!(%error, "reply publish failed");
    }
    working.finish(&reply_msg_id);
}
