//! `subordinates` module: federation record management.
//!
//! The only writer of federation records; the invariants live in
//! [`crate::federation`] and every mutation here runs under the
//! `subordinates` write lock held by the dispatch chain. Federation
//! failures (bad token, broken store) surface as `{"result": false}`
//! refusals, never as wire errors.

use std::sync::Arc;

use async_trait::async_trait;
use foris_core::locks::{LockMode, LOCK_SUBORDINATES};
use serde_json::{json, Value};
use tracing::warn;

use crate::federation::{
    FederationStore, MockFederation, OpenwrtFederation, SubordinateToken,
};
use crate::registry::{ActionSpec, HandlerError, HandlerReply, ModuleDescriptor, ModuleHandler};
use crate::state::DaemonContext;

static ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "list",
        notification: false,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Read)),
    },
    ActionSpec {
        name: "add_sub",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "del",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "set_enabled",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "update_sub",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "add_subsub",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "update_subsub",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
    ActionSpec {
        name: "del_subsub",
        notification: true,
        requestable: true,
        lock: Some((LOCK_SUBORDINATES, LockMode::Write)),
    },
];

const SCHEMA: &str = r##"{
    "module": "subordinates",
    "actions": {
        "list": {
            "reply": {
                "type": "object",
                "properties": {
                    "subordinates": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "controller_id": {"$ref": "#/definitions/controller_id"},
                                "enabled": {"type": "boolean"},
                                "custom_name": {"$ref": "#/definitions/custom_name"},
                                "subsubordinates": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "controller_id": {"$ref": "#/definitions/controller_id"},
                                            "enabled": {"type": "boolean"},
                                            "custom_name": {"$ref": "#/definitions/custom_name"},
                                            "via": {"$ref": "#/definitions/controller_id"}
                                        },
                                        "required": ["controller_id", "enabled", "custom_name", "via"],
                                        "additionalProperties": false
                                    }
                                }
                            },
                            "required": ["controller_id", "enabled", "custom_name", "subsubordinates"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["subordinates"],
                "additionalProperties": false
            }
        },
        "add_sub": {
            "request": {
                "type": "object",
                "properties": {"token": {"type": "string", "minLength": 1}},
                "required": ["token"],
                "additionalProperties": false
            },
            "reply": {
                "type": "object",
                "properties": {
                    "result": {"type": "boolean"},
                    "controller_id": {"$ref": "#/definitions/controller_id"}
                },
                "required": ["result"],
                "additionalProperties": false
            },
            "notification": {
                "type": "object",
                "properties": {"controller_id": {"$ref": "#/definitions/controller_id"}},
                "required": ["controller_id"],
                "additionalProperties": false
            }
        },
        "del": {
            "request": {
                "type": "object",
                "properties": {"controller_id": {"$ref": "#/definitions/controller_id"}},
                "required": ["controller_id"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {"controller_id": {"$ref": "#/definitions/controller_id"}},
                "required": ["controller_id"],
                "additionalProperties": false
            }
        },
        "set_enabled": {
            "request": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "enabled": {"type": "boolean"}
                },
                "required": ["controller_id", "enabled"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "enabled": {"type": "boolean"}
                },
                "required": ["controller_id", "enabled"],
                "additionalProperties": false
            }
        },
        "update_sub": {
            "request": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "custom_name": {"$ref": "#/definitions/custom_name"}
                },
                "required": ["controller_id", "custom_name"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "custom_name": {"$ref": "#/definitions/custom_name"}
                },
                "required": ["controller_id", "custom_name"],
                "additionalProperties": false
            }
        },
        "add_subsub": {
            "request": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "via": {"$ref": "#/definitions/controller_id"}
                },
                "required": ["controller_id", "via"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "via": {"$ref": "#/definitions/controller_id"}
                },
                "required": ["controller_id", "via"],
                "additionalProperties": false
            }
        },
        "update_subsub": {
            "request": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "custom_name": {"$ref": "#/definitions/custom_name"}
                },
                "required": ["controller_id", "custom_name"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {
                    "controller_id": {"$ref": "#/definitions/controller_id"},
                    "custom_name": {"$ref": "#/definitions/custom_name"}
                },
                "required": ["controller_id", "custom_name"],
                "additionalProperties": false
            }
        },
        "del_subsub": {
            "request": {
                "type": "object",
                "properties": {"controller_id": {"$ref": "#/definitions/controller_id"}},
                "required": ["controller_id"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {"controller_id": {"$ref": "#/definitions/controller_id"}},
                "required": ["controller_id"],
                "additionalProperties": false
            }
        }
    }
}"##;

pub static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "subordinates",
    actions: ACTIONS,
    schema: SCHEMA,
};

fn str_field(data: Option<&Value>, field: &str) -> Result<String, HandlerError> {
    data.and_then(|d| d.get(field))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| HandlerError::Internal(format!("validated request lost '{field}'")))
}

fn bool_field(data: Option<&Value>, field: &str) -> Result<bool, HandlerError> {
    data.and_then(|d| d.get(field))
        .and_then(Value::as_bool)
        .ok_or_else(|| HandlerError::Internal(format!("validated request lost '{field}'")))
}

/// Handler over either federation store variant.
pub struct SubordinatesModule {
    store: Arc<dyn FederationStore>,
}

impl SubordinatesModule {
    #[must_use]
    pub fn openwrt(context: &Arc<DaemonContext>) -> Self {
        Self {
            store: Arc::new(OpenwrtFederation::new(context)),
        }
    }

    #[must_use]
    pub fn mock(context: &Arc<DaemonContext>) -> Self {
        Self {
            store: Arc::new(MockFederation::new(context)),
        }
    }
}

#[async_trait]
impl ModuleHandler for SubordinatesModule {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "list" => match self.store.list().await {
                Ok(subordinates) => Ok(HandlerReply::new(json!({
                    "subordinates": subordinates
                        .iter()
                        .map(|s| s.to_json())
                        .collect::<Vec<_>>(),
                }))),
                Err(error) => {
                    warn!(%error, "federation listing failed");
                    Ok(HandlerReply::new(json!({"subordinates": []})))
                }
            },
            "add_sub" => {
                let encoded = str_field(data, "token")?;
                let token = match SubordinateToken::decode(&encoded) {
                    Ok(token) => token,
                    Err(error) => {
                        warn!(%error, "subordinate token rejected");
                        return Ok(HandlerReply::result(false));
                    }
                };
                match self.store.add_sub(&token).await {
                    Ok(true) => {
                        let id = token.conf.device_id.clone();
                        Ok(HandlerReply::new(
                            json!({"result": true, "controller_id": id.clone()}),
                        )
                        .with_notification(json!({"controller_id": id})))
                    }
                    Ok(false) => Ok(HandlerReply::result(false)),
                    Err(error) => {
                        warn!(%error, "subordinate enrollment failed");
                        Ok(HandlerReply::result(false))
                    }
                }
            }
            "del" => {
                let id = str_field(data, "controller_id")?;
                self.outcome(self.store.del(&id).await, json!({"controller_id": id}))
            }
            "set_enabled" => {
                let id = str_field(data, "controller_id")?;
                let enabled = bool_field(data, "enabled")?;
                self.outcome(
                    self.store.set_enabled(&id, enabled).await,
                    json!({"controller_id": id, "enabled": enabled}),
                )
            }
            "update_sub" => {
                let id = str_field(data, "controller_id")?;
                let custom_name = str_field(data, "custom_name")?;
                self.outcome(
                    self.store.update_sub(&id, &custom_name).await,
                    json!({"controller_id": id, "custom_name": custom_name}),
                )
            }
            "add_subsub" => {
                let id = str_field(data, "controller_id")?;
                let via = str_field(data, "via")?;
                self.outcome(
                    self.store.add_subsub(&id, &via).await,
                    json!({"controller_id": id, "via": via}),
                )
            }
            "update_subsub" => {
                let id = str_field(data, "controller_id")?;
                let custom_name = str_field(data, "custom_name")?;
                self.outcome(
                    self.store.update_subsub(&id, &custom_name).await,
                    json!({"controller_id": id, "custom_name": custom_name}),
                )
            }
            "del_subsub" => {
                let id = str_field(data, "controller_id")?;
                self.outcome(
                    self.store.del_subsub(&id).await,
                    json!({"controller_id": id}),
                )
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}

impl SubordinatesModule {
    fn outcome(
        &self,
        result: Result<bool, crate::federation::FederationError>,
        notification: Value,
    ) -> Result<HandlerReply, HandlerError> {
        match result {
            Ok(true) => Ok(HandlerReply::result(true).with_notification(notification)),
            Ok(false) => Ok(HandlerReply::result(false)),
            Err(error) => {
                warn!(%error, "federation mutation failed");
                Ok(HandlerReply::result(false))
            }
        }
    }
}
