//! `web` module: UI language and related web settings.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use foris_core::locks::{LockMode, LOCK_UCI};
use serde_json::{json, Value};
use tracing::warn;

use crate::registry::{ActionSpec, HandlerError, HandlerReply, ModuleDescriptor, ModuleHandler};
use crate::state::DaemonContext;

/// Directory the installed translation catalogues live in.
const LANGS_DIR: &str = "/usr/share/foris/langs";

/// Fallback language, always installed.
const DEFAULT_LANGUAGE: &str = "en";

static ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "get_data",
        notification: false,
        requestable: true,
        lock: Some((LOCK_UCI, LockMode::Read)),
    },
    ActionSpec {
        name: "list_languages",
        notification: false,
        requestable: true,
        lock: None,
    },
    ActionSpec {
        name: "set_language",
        notification: true,
        requestable: true,
        lock: Some((LOCK_UCI, LockMode::Write)),
    },
];

const SCHEMA: &str = r##"{
    "module": "web",
    "actions": {
        "get_data": {
            "reply": {
                "type": "object",
                "properties": {"language": {"$ref": "#/definitions/language"}},
                "required": ["language"],
                "additionalProperties": false
            }
        },
        "list_languages": {
            "reply": {
                "type": "object",
                "properties": {
                    "languages": {
                        "type": "array",
                        "items": {"$ref": "#/definitions/language"}
                    }
                },
                "required": ["languages"],
                "additionalProperties": false
            }
        },
        "set_language": {
            "request": {
                "type": "object",
                "properties": {"language": {"$ref": "#/definitions/language"}},
                "required": ["language"],
                "additionalProperties": false
            },
            "reply": {"$ref": "#/definitions/result_only"},
            "notification": {
                "type": "object",
                "properties": {"language": {"$ref": "#/definitions/language"}},
                "required": ["language"],
                "additionalProperties": false
            }
        }
    }
}"##;

pub static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "web",
    actions: ACTIONS,
    schema: SCHEMA,
};

fn requested_language(data: Option<&Value>) -> Result<String, HandlerError> {
    data.and_then(|d| d.get("language"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| HandlerError::Internal("validated request lost 'language'".to_string()))
}

/// Production variant: language persisted in `foris.settings.lang`,
/// installed languages discovered from the translation directory.
pub struct OpenwrtWeb {
    context: Arc<DaemonContext>,
}

impl OpenwrtWeb {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    fn installed_languages(&self) -> Vec<String> {
        let mut languages = vec![DEFAULT_LANGUAGE.to_string()];
        match self
            .context
            .files
            .list_glob(Path::new(LANGS_DIR), "*.json")
        {
            Ok(entries) => {
                for path in entries {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if stem != DEFAULT_LANGUAGE {
                            languages.push(stem.to_string());
                        }
                    }
                }
            }
            Err(error) => warn!(%error, "translation directory unreadable"),
        }
        languages.sort();
        languages
    }

    async fn current_language(&self) -> String {
        match self.context.uci.read("foris").await {
            Ok(tree) => tree
                .option_named_or("settings", "lang", DEFAULT_LANGUAGE)
                .to_string(),
            Err(error) => {
                warn!(%error, "foris config unreadable; assuming default language");
                DEFAULT_LANGUAGE.to_string()
            }
        }
    }
}

#[async_trait]
impl ModuleHandler for OpenwrtWeb {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_data" => Ok(HandlerReply::new(
                json!({"language": self.current_language().await}),
            )),
            "list_languages" => Ok(HandlerReply::new(
                json!({"languages": self.installed_languages()}),
            )),
            "set_language" => {
                let language = requested_language(data)?;
                if !self.installed_languages().contains(&language) {
                    return Ok(HandlerReply::result(false));
                }
                let mut tx = self.context.uci.transaction();
                tx.add_section("foris", "settings", Some("settings"))
                    .set_option("foris", "settings", "lang", &language);
                tx.commit().await?;
                Ok(HandlerReply::result(true)
                    .with_notification(json!({"language": language})))
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}

/// Mock variant backed by the shared in-memory store.
pub struct MockWeb {
    context: Arc<DaemonContext>,
}

impl MockWeb {
    const INSTALLED: &'static [&'static str] = &["cs", "de", "en"];

    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }
}

#[async_trait]
impl ModuleHandler for MockWeb {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        action: &str,
        data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        match action {
            "get_data" => {
                let state = self.context.mock.get("web");
                let language = state
                    .get("language")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_LANGUAGE);
                Ok(HandlerReply::new(json!({"language": language})))
            }
            "list_languages" => Ok(HandlerReply::new(json!({"languages": Self::INSTALLED}))),
            "set_language" => {
                let language = requested_language(data)?;
                if !Self::INSTALLED.contains(&language.as_str()) {
                    return Ok(HandlerReply::result(false));
                }
                let stored = language.clone();
                self.context.mock.update("web", |state| {
                    state["language"] = json!(stored);
                });
                Ok(HandlerReply::result(true)
                    .with_notification(json!({"language": language})))
            }
            other => Err(HandlerError::Internal(format!("unexpected action {other}"))),
        }
    }
}
