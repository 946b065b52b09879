//! Module registry and request dispatch.
//!
//! The registry is the closed table of modules built at startup: each
//! module contributes an immutable [`ModuleDescriptor`] (name, actions,
//! embedded schema document) bound to one handler instance of the
//! deployment's variant. [`Registry::dispatch`] runs the middleware
//! chain for every request:
//!
//! ```text
//! check kind -> resolve module -> resolve action -> validate data
//!   -> acquire declared lock -> log entry -> invoke handler -> log exit
//!   -> publish notification on success -> compose reply
//! ```
//!
//! The chain is data: each [`ActionSpec`] declares its notification flag
//! and the named lock it must hold, and the registry applies both.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use foris_core::async_cmd::TaskError;
use foris_core::files::FileError;
use foris_core::locks::{LockError, LockMode, LockRegistry};
use foris_core::message::{ErrorCode, ErrorReport, Message, MessageKind};
use foris_core::schema::{MessageValidator, SchemaError, ValidatorBuilder};
use foris_core::services::ServiceError;
use foris_core::uci::UciError;
use futures::FutureExt;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::hub::NotificationHub;

/// Exact description for a request-only transport violation.
const WRONG_KIND_DESCRIPTION: &str = "Wrong message kind (only request are allowed).";

/// One action a module declares.
pub struct ActionSpec {
    pub name: &'static str,
    /// Whether a successful request emits a notification.
    pub notification: bool,
    /// Whether clients may request this action. Notification-only
    /// actions (e.g. `remote`/`advertize`) set this to `false`.
    pub requestable: bool,
    /// Named lock the dispatch chain holds across the handler call.
    pub lock: Option<(&'static str, LockMode)>,
}

/// Immutable module registration record.
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub actions: &'static [ActionSpec],
    /// Embedded module schema document (see [`foris_core::schema`]).
    pub schema: &'static str,
}

impl ModuleDescriptor {
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|spec| spec.name == name)
    }
}

/// Reply produced by a handler action.
pub struct HandlerReply {
    pub data: Value,
    /// Notification payload override; defaults to echoing the request
    /// `data` when the action declares a notification.
    pub notification: Option<Value>,
}

impl HandlerReply {
    /// Reply with an arbitrary payload.
    #[must_use]
    pub const fn new(data: Value) -> Self {
        Self {
            data,
            notification: None,
        }
    }

    /// Plain `{"result": bool}` reply.
    #[must_use]
    pub fn result(value: bool) -> Self {
        Self::new(json!({ "result": value }))
    }

    /// Attach an explicit notification payload.
    #[must_use]
    pub fn with_notification(mut self, data: Value) -> Self {
        self.notification = Some(data);
        self
    }
}

/// Failures escaping a handler action.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Uci(#[from] UciError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("{0}")]
    Internal(String),
}

/// One module's handler for the deployment's variant.
#[async_trait]
pub trait ModuleHandler: Send + Sync {
    /// The descriptor this handler serves.
    fn descriptor(&self) -> &'static ModuleDescriptor;

    /// Run one validated action. `data` has already passed the request
    /// schema; `action` is guaranteed to be declared and requestable.
    async fn handle(&self, action: &str, data: Option<&Value>)
        -> Result<HandlerReply, HandlerError>;
}

/// Registry construction failures; these abort startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{0}' registered twice")]
    DuplicateModule(String),
    #[error("module filter names unknown module '{0}'")]
    UnknownFilteredModule(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// The closed module table plus everything dispatch needs.
pub struct Registry {
    handlers: BTreeMap<&'static str, Box<dyn ModuleHandler>>,
    validator: MessageValidator,
    hub: NotificationHub,
    locks: Arc<LockRegistry>,
    debug: bool,
}

impl Registry {
    /// Build the registry from handler instances.
    ///
    /// Composes every module's schema document into the validator; any
    /// malformed schema fails startup here.
    pub fn new(
        handlers: Vec<Box<dyn ModuleHandler>>,
        hub: NotificationHub,
        locks: Arc<LockRegistry>,
        debug: bool,
    ) -> Result<Self, RegistryError> {
        let mut table: BTreeMap<&'static str, Box<dyn ModuleHandler>> = BTreeMap::new();
        let mut builder = ValidatorBuilder::new();
        for handler in handlers {
            let descriptor = handler.descriptor();
            if table.contains_key(descriptor.name) {
                return Err(RegistryError::DuplicateModule(descriptor.name.to_string()));
            }
            builder.add_module(descriptor.schema)?;
            table.insert(descriptor.name, handler);
        }
        let validator = builder.build(debug)?;
        Ok(Self {
            handlers: table,
            validator,
            hub,
            locks,
            debug,
        })
    }

    /// Registered module names, sorted.
    #[must_use]
    pub fn modules(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Declared action names of one module.
    #[must_use]
    pub fn actions(&self, module: &str) -> Option<Vec<&'static str>> {
        self.handlers.get(module).map(|handler| {
            handler
                .descriptor()
                .actions
                .iter()
                .map(|spec| spec.name)
                .collect()
        })
    }

    /// The composed schema tree served by introspection queries.
    #[must_use]
    pub fn schemas(&self) -> &Value {
        self.validator.composed()
    }

    /// The hub notifications fan out through.
    #[must_use]
    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Decode raw frame bytes and dispatch; malformed frames produce an
    /// error reply instead of dropping the connection.
    pub async fn dispatch_raw(&self, bytes: &[u8]) -> Message {
        match Message::from_slice(bytes) {
            Ok(message) => self.dispatch(message).await,
            Err(error) => {
                debug!(%error, "dropping malformed frame");
                Message {
                    module: "unknown".to_string(),
                    action: "unknown".to_string(),
                    kind: MessageKind::Reply,
                    data: None,
                    errors: vec![ErrorReport::incorrect_input(
                        ErrorCode::ValidationFailed,
                        &format!("malformed message ({error})"),
                    )],
                }
            }
        }
    }

    /// Run the dispatch chain for one envelope.
    pub async fn dispatch(&self, message: Message) -> Message {
        if message.kind != MessageKind::Request {
            return Message::error_reply_to(
                &message,
                vec![ErrorReport {
                    code: ErrorCode::WrongMessageKind,
                    description: WRONG_KIND_DESCRIPTION.to_string(),
                    stacktrace: None,
                }],
            );
        }
        let Some(handler) = self.handlers.get(message.module.as_str()) else {
            return Message::error_reply_to(
                &message,
                vec![ErrorReport::incorrect_input(
                    ErrorCode::UnknownModule,
                    "Unknown module",
                )],
            );
        };
        let descriptor = handler.descriptor();
        let Some(action) = descriptor.action(&message.action).filter(|a| a.requestable) else {
            return Message::error_reply_to(
                &message,
                vec![ErrorReport::incorrect_input(
                    ErrorCode::UnknownAction,
                    "Unknown action",
                )],
            );
        };

        if let Err(error) = self.validator.validate(&message) {
            return Message::error_reply_to(
                &message,
                vec![ErrorReport {
                    code: ErrorCode::ValidationFailed,
                    description: error.to_string(),
                    stacktrace: None,
                }],
            );
        }

        // Declared lock is held across the handler call and released on
        // every exit path.
        let guard = match action.lock {
            Some((name, mode)) => {
                let acquired = match mode {
                    LockMode::Read => self.locks.read(name).await,
                    LockMode::Write => self.locks.write(name).await,
                };
                match acquired {
                    Ok(guard) => Some(guard),
                    Err(error) => {
                        error!(%error, module = %message.module, action = %message.action, "lock acquisition failed");
                        return self.internal_error_reply(
                            &message,
                            &format!("lock failure: {error}"),
                            None,
                        );
                    }
                }
            }
            None => None,
        };

        info!(module = %message.module, action = %message.action, "request dispatched");
        let invoked = std::panic::AssertUnwindSafe(handler.handle(&message.action, message.data.as_ref()))
            .catch_unwind()
            .await;
        let result = match invoked {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(module = %message.module, action = %message.action, %detail, "handler panicked");
                return self.internal_error_reply(&message, "Internal error", Some(detail));
            }
        };
        drop(guard);

        match result {
            Ok(reply) => {
                let response = Message::reply_to(&message, reply.data);
                info!(module = %message.module, action = %message.action, "request handled");
                // Mutations that refused (`result:false`) stay silent.
                if action.notification && !response.is_refusal() {
                    let payload = reply
                        .notification
                        .or_else(|| message.data.clone())
                        .unwrap_or_else(|| json!({}));
                    self.notify(&message.module, &message.action, payload);
                }
                response
            }
            Err(HandlerError::Service(error @ ServiceError::CmdFailed { .. })) => {
                warn!(module = %message.module, action = %message.action, %error, "service failure");
                Message::error_reply_to(
                    &message,
                    vec![ErrorReport {
                        code: ErrorCode::ServiceFailed,
                        description: error.to_string(),
                        stacktrace: None,
                    }],
                )
            }
            Err(error) => {
                error!(module = %message.module, action = %message.action, %error, "handler failed");
                let stacktrace = format!("{error:?}");
                self.internal_error_reply(&message, &error.to_string(), Some(stacktrace))
            }
        }
    }

    /// Compose, validate (debug mode) and publish one notification.
    pub fn notify(&self, module: &str, action: &str, data: Value) {
        let notification = Message::notification(module, action, Some(data));
        if let Err(error) = self.validator.validate_outbound(&notification) {
            warn!(%error, module, action, "outbound notification failed validation");
        }
        self.hub.publish(&notification);
    }

    fn internal_error_reply(
        &self,
        message: &Message,
        description: &str,
        stacktrace: Option<String>,
    ) -> Message {
        // Stacktraces never leave the node unless debug mode is on.
        let stacktrace = if self.debug { stacktrace } else { None };
        Message::error_reply_to(
            message,
            vec![ErrorReport::internal(description, stacktrace)],
        )
    }
}

#[cfg(test)]
mod tests {
    use foris_core::locks::LockBackend;

    use super::*;

    static ECHO_ACTIONS: &[ActionSpec] = &[
        ActionSpec {
            name: "echo",
            notification: true,
            requestable: true,
            lock: None,
        },
        ActionSpec {
            name: "refuse",
            notification: true,
            requestable: true,
            lock: None,
        },
        ActionSpec {
            name: "boom",
            notification: false,
            requestable: true,
            lock: None,
        },
        ActionSpec {
            name: "tick",
            notification: true,
            requestable: false,
            lock: None,
        },
    ];

    static ECHO_DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
        name: "echo",
        actions: ECHO_ACTIONS,
        schema: r##"{
            "module": "echo",
            "actions": {
                "echo": {
                    "request": {
                        "type": "object",
                        "properties": {"value": {"type": "string"}},
                        "required": ["value"],
                        "additionalProperties": false
                    },
                    "reply": {"type": "object"},
                    "notification": {"type": "object"}
                },
                "refuse": {"reply": {"$ref": "#/definitions/result_only"}},
                "boom": {"reply": {"type": "object"}},
                "tick": {"notification": {"type": "object"}}
            }
        }"##,
    };

    struct EchoHandler;

    #[async_trait]
    impl ModuleHandler for EchoHandler {
        fn descriptor(&self) -> &'static ModuleDescriptor {
            &ECHO_DESCRIPTOR
        }

        async fn handle(
            &self,
            action: &str,
            data: Option<&Value>,
        ) -> Result<HandlerReply, HandlerError> {
            match action {
                "echo" => Ok(HandlerReply::new(data.cloned().unwrap_or(json!({})))),
                "refuse" => Ok(HandlerReply::result(false)),
                "boom" => Err(HandlerError::Internal("exploded".to_string())),
                _ => Err(HandlerError::Internal(format!("unexpected action {action}"))),
            }
        }
    }

    fn registry(debug: bool) -> Registry {
        Registry::new(
            vec![Box::new(EchoHandler)],
            NotificationHub::new(),
            Arc::new(LockRegistry::new(LockBackend::InProcess)),
            debug,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn round_trip_preserves_module_action_and_kind() {
        let registry = registry(false);
        let request = Message::request("echo", "echo", Some(json!({"value": "x"})));
        let reply = registry.dispatch(request.clone()).await;
        assert_eq!(reply.module, request.module);
        assert_eq!(reply.action, request.action);
        assert_eq!(reply.kind, MessageKind::Reply);
        assert!(reply.errors.is_empty());
    }

    #[tokio::test]
    async fn unknown_module_and_action_are_rejected() {
        let registry = registry(false);
        let reply = registry
            .dispatch(Message::request("nope", "echo", None))
            .await;
        assert_eq!(reply.errors[0].description, "Incorrect input. Unknown module");
        let reply = registry
            .dispatch(Message::request("echo", "nope", None))
            .await;
        assert_eq!(reply.errors[0].description, "Incorrect input. Unknown action");
    }

    #[tokio::test]
    async fn notification_only_action_is_not_requestable() {
        let registry = registry(false);
        let reply = registry
            .dispatch(Message::request("echo", "tick", None))
            .await;
        assert_eq!(reply.errors[0].description, "Incorrect input. Unknown action");
    }

    #[tokio::test]
    async fn wrong_kind_is_refused() {
        let registry = registry(false);
        let reply = registry
            .dispatch(Message::notification("echo", "echo", None))
            .await;
        assert_eq!(reply.errors[0].description, WRONG_KIND_DESCRIPTION);
    }

    #[tokio::test]
    async fn schema_violation_produces_no_side_effects() {
        let registry = registry(false);
        let sub = registry
            .hub()
            .subscribe(crate::hub::SubscriptionFilter::All);
        let reply = registry
            .dispatch(Message::request("echo", "echo", Some(json!({"bad": 1}))))
            .await;
        assert!(reply.errors[0]
            .description
            .starts_with(foris_core::INCORRECT_INPUT_PREFIX));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn success_emits_notification_before_reply_is_observed() {
        let registry = registry(false);
        let sub = registry
            .hub()
            .subscribe(crate::hub::SubscriptionFilter::All);
        let reply = registry
            .dispatch(Message::request("echo", "echo", Some(json!({"value": "x"}))))
            .await;
        assert!(reply.errors.is_empty());
        let notification = sub.try_recv().expect("notification missing");
        assert_eq!(notification.kind, MessageKind::Notification);
        assert_eq!(notification.data, Some(json!({"value": "x"})));
    }

    #[tokio::test]
    async fn refusal_emits_no_notification() {
        let registry = registry(false);
        let sub = registry
            .hub()
            .subscribe(crate::hub::SubscriptionFilter::All);
        let reply = registry
            .dispatch(Message::request("echo", "refuse", None))
            .await;
        assert!(reply.is_refusal());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn handler_error_is_wrapped_and_stacktrace_is_debug_gated() {
        let reply = registry(false)
            .dispatch(Message::request("echo", "boom", None))
            .await;
        assert_eq!(reply.errors[0].code, ErrorCode::Internal);
        assert!(reply.errors[0].stacktrace.is_none());

        let reply = registry(true)
            .dispatch(Message::request("echo", "boom", None))
            .await;
        assert!(reply.errors[0].stacktrace.is_some());
    }

    #[tokio::test]
    async fn malformed_frame_yields_error_reply() {
        let registry = registry(false);
        let reply = registry.dispatch_raw(b"{not json").await;
        assert!(reply.is_error_reply());
        assert!(reply.errors[0]
            .description
            .starts_with(foris_core::INCORRECT_INPUT_PREFIX));
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = Registry::new(
            vec![Box::new(EchoHandler), Box::new(EchoHandler)],
            NotificationHub::new(),
            Arc::new(LockRegistry::new(LockBackend::InProcess)),
            false,
        );
        assert!(matches!(result, Err(RegistryError::DuplicateModule(_))));
    }
}
