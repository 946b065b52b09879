//! `remote` module: remote-access CA management and the advertisement
//! notification.
//!
//! CA and server certificate generation wraps the external generator,
//! which reports progress on stdout; the async command runtime turns the
//! matched lines into `generate_ca` notifications correlated by task id.
//! The `advertize` action is notification-only: the daemon's
//! advertisement loop publishes it, clients cannot request it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use foris_core::async_cmd::{ProgressPattern, TaskOrigin};
use foris_core::exec;
use foris_core::locks::LockMode;
use serde_json::{json, Value};
use tracing::warn;

use crate::registry::{ActionSpec, HandlerError, HandlerReply, ModuleDescriptor, ModuleHandler};
use crate::state::DaemonContext;

/// Directory the remote-access CA lives in.
const CA_DIR: &str = "/etc/ssl/ca/remote";
/// External certificate generator.
const CAGEN_BIN: &str = "/usr/bin/turris-cagen";
/// Lock serializing every CA mutation.
const LOCK_CA: &str = "remote.ca";

static ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "get_status",
        notification: false,
        requestable: true,
        lock: Some((LOCK_CA, LockMode::Read)),
    },
    ActionSpec {
        name: "generate_ca",
        notification: false,
        requestable: true,
        lock: Some((LOCK_CA, LockMode::Write)),
    },
    ActionSpec {
        name: "create_token",
        notification: true,
        requestable: true,
        lock: Some((LOCK_CA, LockMode::Write)),
    },
    ActionSpec {
        name: "revoke",
        notification: true,
        requestable: true,
        lock: Some((LOCK_CA, LockMode::Write)),
    },
    ActionSpec {
        name: "delete_ca",
        notification: true,
        requestable: true,
        lock: Some((LOCK_CA, LockMode::Write)),
    },
    ActionSpec {
        name: "advertize",
        notification: true,
        requestable: false,
        lock: None,
    },
];

const SCHEMA: &str = r##"{
    "module": "remote",
    "actions": {
        "get_status": {
            "reply": {
                "type": "object",
                "properties": {
                    "status": {"enum": ["missing", "generating", "ready"]},
                    "tokens": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "name": {"type": "string"},
                                "status": {"enum": ["valid", "revoked"]}
                            },
                            "required": ["id", "name", "status"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["status", "tokens"],
                "additionalProperties": false
            }
        },
        "generate_ca": {
            "reply": {
                "type": "object",
                "properties": {"task_id": {"$ref": "#/definitions/task_id"}},
                "required": ["task_id"],
                "additionalProperties": false
            },
            "notification": {
                "type": "object",
                "properties": {
                    "task_id": {"$ref": "#/definitions/task_id"},
                    "status": {"type": "string"}
                },
                "required": ["task_id", "status"],
                "additionalProperties": false
            }
        },
        "create_token": {
            "request": {
                "type": "object",
                "properties": {
                    "name": {"type": "string", "pattern": "^[a-zA-Z0-9_-]{1,63}$"}
                },
                "required": ["name"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
                "additionalProperties": false
            }
        },
        "revoke": {
            "request": {
                "type": "object",
                "properties": {"id": {"type": "string", "minLength": 1}},
                "required": ["id"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"],
                "additionalProperties": false
            }
        },
        "delete_ca": {
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {"type": "object"}
        },
        "advertize": {
            "notification": {
                "type": "object",
                "properties": {
                    "state": {"enum": ["started", "running", "exited"]},
                    "id": {"$ref": "#/definitions/controller_id"},
                    "hostname": {"type": "string"},
                    "netboot": {"enum": ["unknown", "booted", "ready"]},
                    "modules": {
                        "type": "array",
                        "items": {"type": "string"},
                        "minItems": 1
                    },
                    "working_replies": {
                        "type": "array",
                        "items": {"type": "string"}
                    }
                },
                "required": ["state", "id", "hostname", "netboot", "modules"],
                "additionalProperties": false
            }
        }
    }
}"##;

pub static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "remote",
    actions: ACTIONS,
    schema: SCHEMA,
};

/// Progress patterns of the certificate generator's stdout contract.
///
/// The pattern list is the interface of the wrapped tool; keep it in one
/// place so swapping the generator stays a local change.
fn cagen_patterns() -> Vec<ProgressPattern> {
    [
        (r"^gen_ca: started", "ca_generating"),
        (r"^gen_ca: done", "ca_done"),
        (r"^gen_server: started", "server_generating"),
        (r"^gen_server: done", "server_done"),
    ]
    .iter()
    .filter_map(|(pattern, event)| ProgressPattern::new(pattern, event).ok())
    .collect()
}

fn task_origin() -> TaskOrigin {
    TaskOrigin::new("remote", "generate_ca")
}

fn token_name(data: Option<&Value>, field: &str) -> Result<String, HandlerError> {
    data.and_then(|d| d.get(field))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| HandlerError::Internal(format!("validated request lost '{field}'")))
}

/// Production variant wrapping the real generator.
pub struct OpenwrtRemote {
    context: Arc<DaemonContext>,
}

impl OpenwrtRemote {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    fn ca_ready(&self) -> bool {
        self.context
            .files
            .exists(&Path::new(CA_DIR).join("ca.crt"))
    }

    fn ca_generating(&self) -> bool {
        self.context
            .tasks
            .running_tasks()
            .iter()
            .any(|(id, _)| {
                self.context
                    .tasks
                    .argv(id)
                    .is_some_and(|argv| argv.first().is_some_and(|p| p.contains("turris-cagen")))
            })
    }

    fn tokens(&self) -> Vec<Value> {
        let mut tokens = Vec::new();
        if let Ok(entries) = self.context.files.list_glob(Path::new(CA_DIR), "*.crt") {
            for path in entries {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if stem == "ca" || stem == "server" {
                    continue;
                }
                tokens.push(json!({"id": stem, "name": stem, "status": "valid"}));
            }
        }
        tokens
    }

    async fn cagen(&self, args: &[&str]) -> Result<bool, HandlerError> {
        let output = exec::run(Path::new(CAGEN_BIN), args, None).await.map_err(
            |error| {
                warn!(%error, "certificate generator unavailable");
                HandlerError::Internal(error.to_string())
            },
        )?;
        Ok(output.success())
    }
}

#[async_trait]
impl ModuleHandler for OpenwrtRemote {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_status" => {
                let status = if self.ca_generating() {
                    "generating"
                } else if self.ca_ready() {
                    "ready"
                } else {
                    "missing"
                };
                Ok(HandlerReply::new(
                    json!({"status": status, "tokens": self.tokens()}),
                ))
            }
            "generate_ca" => {
                let argv = vec![
                    CAGEN_BIN.to_string(),
                    "new_ca".to_string(),
                    "remote".to_string(),
                    "gen_ca".to_string(),
                    "gen_server".to_string(),
                    "server".to_string(),
                ];
                let task_id =
                    self.context
                        .tasks
                        .spawn(task_origin(), argv, cagen_patterns(), None)?;
                Ok(HandlerReply::new(json!({"task_id": task_id})))
            }
            "create_token" => {
                let name = token_name(data, "name")?;
                let created = self.cagen(&["gen_client", "remote", &name]).await?;
                if created {
                    Ok(HandlerReply::result(true).with_notification(json!({"name": name})))
                } else {
                    Ok(HandlerReply::result(false))
                }
            }
            "revoke" => {
                let id = token_name(data, "id")?;
                let revoked = self.cagen(&["rev", "remote", &id]).await?;
                if revoked {
                    Ok(HandlerReply::result(true).with_notification(json!({"id": id})))
                } else {
                    Ok(HandlerReply::result(false))
                }
            }
            "delete_ca" => {
                match self.context.files.remove_dir_all(Path::new(CA_DIR)) {
                    Ok(()) => Ok(HandlerReply::result(true).with_notification(json!({}))),
                    Err(error) => {
                        warn!(%error, "CA removal failed");
                        Ok(HandlerReply::result(false))
                    }
                }
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}

/// Mock variant: CA state in the shared store; generation runs a shell
/// child that replays the generator's stdout contract so the progress
/// pipeline is exercised for real.
pub struct MockRemote {
    context: Arc<DaemonContext>,
}

impl MockRemote {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    fn ca_ready(&self) -> bool {
        self.context.mock.get("remote")["ca"].as_bool().unwrap_or(false)
    }
}

#[async_trait]
impl ModuleHandler for MockRemote {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_status" => {
                let state = self.context.mock.get("remote");
                let tokens = state["tokens"].as_array().cloned().unwrap_or_default();
                let status = if self.ca_ready() { "ready" } else { "missing" };
                Ok(HandlerReply::new(json!({"status": status, "tokens": tokens})))
            }
            "generate_ca" => {
                let script = if self.ca_ready() {
                    "echo 'CA already exists' >&2; exit 1".to_string()
                } else {
                    "echo 'gen_ca: started'; echo 'gen_ca: done'; \
                     echo 'gen_server: started'; echo 'gen_server: done'"
                        .to_string()
                };
                let argv = vec!["sh".to_string(), "-c".to_string(), script];
                let store_context = Arc::clone(&self.context);
                let task_id = self.context.tasks.spawn(
                    task_origin(),
                    argv,
                    cagen_patterns(),
                    Some(Box::new(move |_, exit_code| {
                        if exit_code == 0 {
                            store_context.mock.update("remote", |state| {
                                state["ca"] = json!(true);
                            });
                        }
                    })),
                )?;
                Ok(HandlerReply::new(json!({"task_id": task_id})))
            }
            "create_token" => {
                if !self.ca_ready() {
                    return Ok(HandlerReply::result(false));
                }
                let name = token_name(data, "name")?;
                let stored = name.clone();
                self.context.mock.update("remote", |state| {
                    let tokens = state["tokens"].as_array().cloned().unwrap_or_default();
                    let mut tokens = tokens;
                    tokens.push(json!({"id": stored.clone(), "name": stored, "status": "valid"}));
                    state["tokens"] = json!(tokens);
                });
                Ok(HandlerReply::result(true).with_notification(json!({"name": name})))
            }
            "revoke" => {
                let id = token_name(data, "id")?;
                let target = id.clone();
                let mut found = false;
                self.context.mock.update("remote", |state| {
                    if let Some(tokens) = state["tokens"].as_array_mut() {
                        for token in tokens {
                            if token["id"].as_str() == Some(target.as_str()) {
                                token["status"] = json!("revoked");
                                found = true;
                            }
                        }
                    }
                });
                if found {
                    Ok(HandlerReply::result(true).with_notification(json!({"id": id})))
                } else {
                    Ok(HandlerReply::result(false))
                }
            }
            "delete_ca" => {
                self.context.mock.update("remote", |state| {
                    state["ca"] = json!(false);
                    state["tokens"] = json!([]);
                });
                Ok(HandlerReply::result(true).with_notification(json!({})))
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}
