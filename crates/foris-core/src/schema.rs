//! Schema composition and message validation.
//!
//! At startup the module registry feeds a [`ValidatorBuilder`] one schema
//! document per module plus the cross-cutting base definitions embedded
//! below. `build()` compiles one `jsonschema` validator per declared
//! `(module, action, kind)` tuple; [`MessageValidator::validate`] then
//! accepts exactly the envelopes whose tuple is known and whose `data`
//! matches the compiled schema.
//!
//! Validation failures carry descriptions starting with the literal
//! `"Incorrect input."` — part of the wire contract, asserted by clients.
//!
//! A module schema document has the shape:
//!
//! ```json
//! {
//!     "module": "dns",
//!     "actions": {
//!         "get_settings": {"reply": {"type": "object"}},
//!         "update_settings": {
//!             "request": {"type": "object", "...": "..."},
//!             "reply": {"$ref": "#/definitions/result_only"},
//!             "notification": {"type": "object", "...": "..."}
//!         }
//!     }
//! }
//! ```
//!
//! An action without a `request` schema accepts requests with no `data`
//! at all; unknown fields are rejected everywhere
//! (`additionalProperties: false` in every data schema).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::{Message, MessageKind, INCORRECT_INPUT_PREFIX};

/// Cross-cutting definitions every data schema may `$ref`.
const BASE_DEFINITIONS: &str = r#"{
    "controller_id": {"type": "string", "pattern": "^[a-fA-F0-9]{16}$"},
    "result_only": {
        "type": "object",
        "properties": {"result": {"type": "boolean"}},
        "required": ["result"],
        "additionalProperties": false
    },
    "task_id": {"type": "string", "minLength": 1},
    "language": {"type": "string", "pattern": "^[a-z]{2}(_[A-Z]{2})?$"},
    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
    "custom_name": {"type": "string", "maxLength": 63}
}"#;

/// Schema loading, composition and validation failures.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse schema document: {0}")]
    ParseDocument(#[from] serde_json::Error),
    #[error("schema document for module '{module}' is malformed: {detail}")]
    MalformedDocument { module: String, detail: String },
    #[error("failed to compile schema for {module}/{action} ({kind}): {detail}")]
    Compile {
        module: String,
        action: String,
        kind: &'static str,
        detail: String,
    },
    #[error("duplicate schema for module '{module}'")]
    DuplicateModule { module: String },
    #[error("failed to read schema directory '{path}': {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{INCORRECT_INPUT_PREFIX} Unknown module")]
    UnknownModule,
    #[error("{INCORRECT_INPUT_PREFIX} Unknown action")]
    UnknownAction,
    #[error("{INCORRECT_INPUT_PREFIX} {detail}")]
    Validation { detail: String },
}

#[derive(Debug, Default)]
struct ActionSchemas {
    request: Option<Value>,
    reply: Option<Value>,
    notification: Option<Value>,
}

#[derive(Debug)]
struct ModuleSchemaDoc {
    module: String,
    actions: BTreeMap<String, ActionSchemas>,
}

fn parse_module_doc(raw: &Value) -> Result<ModuleSchemaDoc, SchemaError> {
    let module = raw
        .get("module")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::MalformedDocument {
            module: "<unknown>".to_string(),
            detail: "missing 'module' field".to_string(),
        })?
        .to_string();
    let actions_value =
        raw.get("actions")
            .and_then(Value::as_object)
            .ok_or_else(|| SchemaError::MalformedDocument {
                module: module.clone(),
                detail: "missing 'actions' object".to_string(),
            })?;
    let mut actions = BTreeMap::new();
    for (action, body) in actions_value {
        let body = body.as_object().ok_or_else(|| SchemaError::MalformedDocument {
            module: module.clone(),
            detail: format!("action '{action}' is not an object"),
        })?;
        actions.insert(
            action.clone(),
            ActionSchemas {
                request: body.get("request").cloned(),
                reply: body.get("reply").cloned(),
                notification: body.get("notification").cloned(),
            },
        );
    }
    Ok(ModuleSchemaDoc { module, actions })
}

/// Collects module schema documents and compiles the validator.
pub struct ValidatorBuilder {
    definitions: Map<String, Value>,
    modules: Vec<ModuleSchemaDoc>,
}

impl Default for ValidatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorBuilder {
    #[must_use]
    pub fn new() -> Self {
        let definitions = serde_json::from_str::<Value>(BASE_DEFINITIONS)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        Self {
            definitions,
            modules: Vec::new(),
        }
    }

    /// Register one module's schema document (embedded JSON).
    pub fn add_module(&mut self, raw: &str) -> Result<&mut Self, SchemaError> {
        let value: Value = serde_json::from_str(raw)?;
        let doc = parse_module_doc(&value)?;
        if self.modules.iter().any(|m| m.module == doc.module) {
            return Err(SchemaError::DuplicateModule { module: doc.module });
        }
        self.modules.push(doc);
        Ok(self)
    }

    /// Load every `*.json` module document from a directory. Returns how
    /// many documents were loaded.
    pub fn add_dir(&mut self, dir: &Path) -> Result<usize, SchemaError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::ReadDir {
            path: dir.display().to_string(),
            source,
        })?;
        let mut loaded = 0;
        for entry in entries {
            let entry = entry.map_err(|source| SchemaError::ReadDir {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let raw = std::fs::read_to_string(&path).map_err(|source| SchemaError::ReadDir {
                    path: path.display().to_string(),
                    source,
                })?;
                self.add_module(&raw)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Compile everything into a [`MessageValidator`].
    ///
    /// With `validate_outbound` set (debug mode) replies and notifications
    /// produced by this node are checked too; in production outbound
    /// traffic is trusted.
    pub fn build(self, validate_outbound: bool) -> Result<MessageValidator, SchemaError> {
        let mut slots = HashMap::new();
        let mut modules: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut composed = Map::new();

        for doc in &self.modules {
            let actions = modules.entry(doc.module.clone()).or_default();
            let mut module_json = Map::new();
            for (action, schemas) in &doc.actions {
                actions.insert(action.clone());
                let mut action_json = Map::new();
                for (kind, schema) in [
                    (MessageKind::Request, &schemas.request),
                    (MessageKind::Reply, &schemas.reply),
                    (MessageKind::Notification, &schemas.notification),
                ] {
                    let slot = match schema {
                        Some(schema) => {
                            action_json.insert(kind.as_str().to_string(), schema.clone());
                            Slot::Schema(self.compile(&doc.module, action, kind, schema)?)
                        }
                        None => match kind {
                            // Requests without a declared schema accept
                            // no payload at all.
                            MessageKind::Request => Slot::NoData,
                            _ => Slot::Any,
                        },
                    };
                    slots.insert(
                        (doc.module.clone(), action.clone(), kind),
                        slot,
                    );
                }
                module_json.insert(action.clone(), Value::Object(action_json));
            }
            composed.insert(doc.module.clone(), Value::Object(module_json));
        }

        Ok(MessageValidator {
            modules,
            slots,
            composed: Value::Object(composed),
            validate_outbound,
        })
    }

    fn compile(
        &self,
        module: &str,
        action: &str,
        kind: MessageKind,
        schema: &Value,
    ) -> Result<jsonschema::Validator, SchemaError> {
        // $refs resolve against the wrapped document root, so the base
        // definitions ride along with every compiled schema.
        let mut wrapped = Map::new();
        wrapped.insert(
            "$schema".to_string(),
            Value::String("http://json-schema.org/draft-07/schema#".to_string()),
        );
        let mut definitions = self.definitions.clone();
        if let Some(local) = schema.get("definitions").and_then(Value::as_object) {
            for (key, value) in local {
                definitions.insert(key.clone(), value.clone());
            }
        }
        wrapped.insert("definitions".to_string(), Value::Object(definitions));
        if let Some(object) = schema.as_object() {
            for (key, value) in object {
                if key != "definitions" {
                    wrapped.insert(key.clone(), value.clone());
                }
            }
        }
        let wrapped = Value::Object(wrapped);
        jsonschema::options()
            .build(&wrapped)
            .map_err(|error| SchemaError::Compile {
                module: module.to_string(),
                action: action.to_string(),
                kind: kind.as_str(),
                detail: error.to_string(),
            })
    }
}

enum Slot {
    /// `data` must be absent.
    NoData,
    /// `data` is not checked (undeclared reply/notification schema).
    Any,
    Schema(jsonschema::Validator),
}

/// Compiled validator for every registered tuple.
pub struct MessageValidator {
    modules: BTreeMap<String, BTreeSet<String>>,
    slots: HashMap<(String, String, MessageKind), Slot>,
    composed: Value,
    validate_outbound: bool,
}

impl MessageValidator {
    /// Registered module names.
    #[must_use]
    pub fn modules(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    #[must_use]
    pub fn has_action(&self, module: &str, action: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|actions| actions.contains(action))
    }

    /// The composed schema tree, as served by introspection queries.
    #[must_use]
    pub const fn composed(&self) -> &Value {
        &self.composed
    }

    /// Whether outbound replies/notifications are validated too.
    #[must_use]
    pub const fn validates_outbound(&self) -> bool {
        self.validate_outbound
    }

    /// Validate one envelope against the composed schema set.
    pub fn validate(&self, message: &Message) -> Result<(), SchemaError> {
        if !self.has_module(&message.module) {
            return Err(SchemaError::UnknownModule);
        }
        if !self.has_action(&message.module, &message.action) {
            return Err(SchemaError::UnknownAction);
        }
        match message.kind {
            MessageKind::Request | MessageKind::Notification => {
                if !message.errors.is_empty() {
                    return Err(SchemaError::Validation {
                        detail: format!("{} messages cannot carry errors", message.kind),
                    });
                }
            }
            MessageKind::Reply => {
                // Error replies are exempt from data schemas; the errors
                // list itself is the payload.
                if message.is_error_reply() {
                    return Ok(());
                }
            }
        }
        let slot = self
            .slots
            .get(&(
                message.module.clone(),
                message.action.clone(),
                message.kind,
            ))
            .ok_or(SchemaError::UnknownAction)?;
        match slot {
            Slot::Any => Ok(()),
            Slot::NoData => match &message.data {
                None => Ok(()),
                Some(_) => Err(SchemaError::Validation {
                    detail: format!(
                        "action '{}' of module '{}' takes no data",
                        message.action, message.module
                    ),
                }),
            },
            Slot::Schema(validator) => {
                let data = message.data.clone().unwrap_or(Value::Null);
                validator
                    .validate(&data)
                    .map_err(|error| SchemaError::Validation {
                        detail: error.to_string(),
                    })
            }
        }
    }

    /// Validate an outbound envelope when debug mode asks for it.
    pub fn validate_outbound(&self, message: &Message) -> Result<(), SchemaError> {
        if self.validate_outbound {
            self.validate(message)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::Message;

    const DNS_DOC: &str = r##"{
        "module": "dns",
        "actions": {
            "get_settings": {
                "reply": {"type": "object"}
            },
            "update_settings": {
                "request": {
                    "type": "object",
                    "properties": {
                        "forwarding_enabled": {"type": "boolean"},
                        "dnssec_enabled": {"type": "boolean"},
                        "dns_from_dhcp_enabled": {"type": "boolean"}
                    },
                    "required": [
                        "forwarding_enabled",
                        "dnssec_enabled",
                        "dns_from_dhcp_enabled"
                    ],
                    "additionalProperties": false
                },
                "reply": {"$ref": "#/definitions/result_only"},
                "notification": {"type": "object"}
            }
        }
    }"##;

    const ABOUT_DOC: &str = r#"{
        "module": "about",
        "actions": {
            "get": {"reply": {"type": "object"}}
        }
    }"#;

    fn validator() -> MessageValidator {
        let mut builder = ValidatorBuilder::new();
        builder.add_module(DNS_DOC).unwrap();
        builder.add_module(ABOUT_DOC).unwrap();
        builder.build(true).unwrap()
    }

    fn update_request(data: Value) -> Message {
        Message::request("dns", "update_settings", Some(data))
    }

    #[test]
    fn accepts_valid_request() {
        let validator = validator();
        let msg = update_request(json!({
            "forwarding_enabled": false,
            "dnssec_enabled": false,
            "dns_from_dhcp_enabled": false
        }));
        validator.validate(&msg).unwrap();
    }

    #[test]
    fn rejects_missing_required_field() {
        let validator = validator();
        let msg = update_request(json!({"forwarding_enabled": false}));
        let error = validator.validate(&msg).unwrap_err();
        assert!(error.to_string().starts_with(INCORRECT_INPUT_PREFIX));
    }

    #[test]
    fn rejects_unknown_field() {
        let validator = validator();
        let msg = update_request(json!({
            "forwarding_enabled": false,
            "dnssec_enabled": false,
            "dns_from_dhcp_enabled": false,
            "extra": 1
        }));
        assert!(validator.validate(&msg).is_err());
    }

    #[test]
    fn rejects_wrong_type() {
        let validator = validator();
        let msg = update_request(json!({
            "forwarding_enabled": "no",
            "dnssec_enabled": false,
            "dns_from_dhcp_enabled": false
        }));
        assert!(validator.validate(&msg).is_err());
    }

    #[test]
    fn rejects_data_on_schemaless_request() {
        let validator = validator();
        let msg = Message::request("about", "get", Some(json!({"extra": "data"})));
        let error = validator.validate(&msg).unwrap_err();
        assert!(error.to_string().starts_with(INCORRECT_INPUT_PREFIX));
        // And no data passes.
        let ok = Message::request("about", "get", None);
        validator.validate(&ok).unwrap();
    }

    #[test]
    fn unknown_module_and_action() {
        let validator = validator();
        let msg = Message::request("nope", "get", None);
        assert!(matches!(
            validator.validate(&msg),
            Err(SchemaError::UnknownModule)
        ));
        let msg = Message::request("dns", "nope", None);
        assert!(matches!(
            validator.validate(&msg),
            Err(SchemaError::UnknownAction)
        ));
    }

    #[test]
    fn base_definition_refs_resolve() {
        let validator = validator();
        let reply = Message::reply_to(
            &update_request(json!({})),
            json!({"result": true}),
        );
        validator.validate(&reply).unwrap();
        let bad = Message::reply_to(&update_request(json!({})), json!({"result": "yes"}));
        assert!(validator.validate(&bad).is_err());
    }

    #[test]
    fn error_replies_bypass_data_schema() {
        let validator = validator();
        let request = update_request(json!({}));
        let reply = Message::error_reply_to(
            &request,
            vec![crate::message::ErrorReport::incorrect_input(
                crate::message::ErrorCode::ValidationFailed,
                "bad",
            )],
        );
        validator.validate(&reply).unwrap();
    }

    #[test]
    fn duplicate_module_rejected() {
        let mut builder = ValidatorBuilder::new();
        builder.add_module(DNS_DOC).unwrap();
        assert!(matches!(
            builder.add_module(DNS_DOC),
            Err(SchemaError::DuplicateModule { .. })
        ));
    }

    #[test]
    fn directory_documents_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dns.json"), DNS_DOC).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let mut builder = ValidatorBuilder::new();
        let loaded = builder.add_dir(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        let validator = builder.build(false).unwrap();
        assert!(validator.has_module("dns"));
    }
}
