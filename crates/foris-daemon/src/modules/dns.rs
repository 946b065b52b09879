//! `dns` module: resolver settings.
//!
//! Settings map onto the `resolver` uci file: `forward_upstream` for
//! forwarding, `ignore_root_key` (inverted) for DNSSEC,
//! `dynamic_domains` for DHCP-learned names and `forward_custom` for the
//! selected forwarder. The production variant restarts the resolver
//! service after every committed change.

use std::sync::Arc;

use async_trait::async_trait;
use foris_core::locks::{LockMode, LOCK_UCI};
use foris_core::services::{FailPolicy, Verb};
use foris_core::uci::{parse_bool, store_bool};
use serde_json::{json, Value};

use crate::registry::{ActionSpec, HandlerError, HandlerReply, ModuleDescriptor, ModuleHandler};
use crate::state::DaemonContext;

const RESOLVER_FILE: &str = "resolver";
const RESOLVER_SERVICE: &str = "resolver";
const COMMON_SECTION: &str = "common";

static ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "get_settings",
        notification: false,
        requestable: true,
        lock: Some((LOCK_UCI, LockMode::Read)),
    },
    ActionSpec {
        name: "update_settings",
        notification: true,
        requestable: true,
        lock: Some((LOCK_UCI, LockMode::Write)),
    },
];

const SCHEMA: &str = r##"{
    "module": "dns",
    "actions": {
        "get_settings": {
            "reply": {
                "type": "object",
                "properties": {
                    "forwarding_enabled": {"type": "boolean"},
                    "dnssec_enabled": {"type": "boolean"},
                    "dns_from_dhcp_enabled": {"type": "boolean"},
                    "forwarder": {"type": "string"}
                },
                "required": [
                    "forwarding_enabled",
                    "dnssec_enabled",
                    "dns_from_dhcp_enabled"
                ],
                "additionalProperties": false
            }
        },
        "update_settings": {
            "request": {
                "type": "object",
                "properties": {
                    "forwarding_enabled": {"type": "boolean"},
                    "dnssec_enabled": {"type": "boolean"},
                    "dns_from_dhcp_enabled": {"type": "boolean"},
                    "forwarder": {"type": "string"}
                },
                "required": [
                    "forwarding_enabled",
                    "dnssec_enabled",
                    "dns_from_dhcp_enabled"
                ],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {
                    "forwarding_enabled": {"type": "boolean"},
                    "dnssec_enabled": {"type": "boolean"},
                    "dns_from_dhcp_enabled": {"type": "boolean"},
                    "forwarder": {"type": "string"}
                },
                "required": [
                    "forwarding_enabled",
                    "dnssec_enabled",
                    "dns_from_dhcp_enabled"
                ],
                "additionalProperties": false
            }
        }
    }
}"##;

pub static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "dns",
    actions: ACTIONS,
    schema: SCHEMA,
};

#[derive(Debug, Clone, PartialEq)]
struct DnsSettings {
    forwarding_enabled: bool,
    dnssec_enabled: bool,
    dns_from_dhcp_enabled: bool,
    forwarder: Option<String>,
}

impl DnsSettings {
    fn to_json(&self) -> Value {
        let mut value = json!({
            "forwarding_enabled": self.forwarding_enabled,
            "dnssec_enabled": self.dnssec_enabled,
            "dns_from_dhcp_enabled": self.dns_from_dhcp_enabled,
        });
        if let Some(forwarder) = &self.forwarder {
            value["forwarder"] = json!(forwarder);
        }
        value
    }

    fn from_request(data: Option<&Value>) -> Result<Self, HandlerError> {
        let data = data.ok_or_else(|| {
            HandlerError::Internal("validated request lost its data".to_string())
        })?;
        let flag = |name: &str| {
            data.get(name).and_then(Value::as_bool).ok_or_else(|| {
                HandlerError::Internal(format!("validated request lost '{name}'"))
            })
        };
        Ok(Self {
            forwarding_enabled: flag("forwarding_enabled")?,
            dnssec_enabled: flag("dnssec_enabled")?,
            dns_from_dhcp_enabled: flag("dns_from_dhcp_enabled")?,
            forwarder: data
                .get("forwarder")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        })
    }
}

/// Production variant over the `resolver` uci file.
pub struct OpenwrtDns {
    context: Arc<DaemonContext>,
}

impl OpenwrtDns {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    async fn read_settings(&self) -> Result<DnsSettings, HandlerError> {
        let tree = self.context.uci.read(RESOLVER_FILE).await?;
        // Absent options fall back to the firmware defaults.
        let forwarding = tree.option_named_or(COMMON_SECTION, "forward_upstream", "1");
        let ignore_root_key = tree.option_named_or(COMMON_SECTION, "ignore_root_key", "0");
        let dynamic_domains = tree.option_named_or(COMMON_SECTION, "dynamic_domains", "0");
        let forwarder = tree
            .option_named(COMMON_SECTION, "forward_custom")
            .ok()
            .map(ToString::to_string);
        Ok(DnsSettings {
            forwarding_enabled: parse_bool(forwarding)?,
            dnssec_enabled: !parse_bool(ignore_root_key)?,
            dns_from_dhcp_enabled: parse_bool(dynamic_domains)?,
            forwarder,
        })
    }
}

#[async_trait]
impl ModuleHandler for OpenwrtDns {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_settings" => Ok(HandlerReply::new(self.read_settings().await?.to_json())),
            "update_settings" => {
                let settings = DnsSettings::from_request(data)?;
                let mut tx = self.context.uci.transaction();
                tx.set_option(
                    RESOLVER_FILE,
                    COMMON_SECTION,
                    "forward_upstream",
                    store_bool(settings.forwarding_enabled),
                )
                .set_option(
                    RESOLVER_FILE,
                    COMMON_SECTION,
                    "ignore_root_key",
                    store_bool(!settings.dnssec_enabled),
                )
                .set_option(
                    RESOLVER_FILE,
                    COMMON_SECTION,
                    "dynamic_domains",
                    store_bool(settings.dns_from_dhcp_enabled),
                );
                match &settings.forwarder {
                    Some(forwarder) => {
                        tx.set_option(RESOLVER_FILE, COMMON_SECTION, "forward_custom", forwarder);
                    }
                    None => {
                        tx.del_option(RESOLVER_FILE, COMMON_SECTION, "forward_custom");
                    }
                }
                tx.commit().await?;
                self.context
                    .services
                    .run(RESOLVER_SERVICE, Verb::Restart, FailPolicy::Raise)
                    .await?;
                Ok(HandlerReply::result(true).with_notification(settings.to_json()))
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}

/// Mock variant backed by the shared in-memory store.
pub struct MockDns {
    context: Arc<DaemonContext>,
}

impl MockDns {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }
}

#[async_trait]
impl ModuleHandler for MockDns {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_settings" => {
                let state = self.context.mock.get("dns");
                if state.as_object().is_some_and(|o| !o.is_empty()) {
                    Ok(HandlerReply::new(state))
                } else {
                    Ok(HandlerReply::new(json!({
                        "forwarding_enabled": true,
                        "dnssec_enabled": true,
                        "dns_from_dhcp_enabled": false,
                    })))
                }
            }
            "update_settings" => {
                let settings = DnsSettings::from_request(data)?;
                let stored = settings.to_json();
                self.context.mock.update("dns", |state| {
                    *state = stored.clone();
                });
                Ok(HandlerReply::result(true).with_notification(settings.to_json()))
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}
