//! `about` module: static device information.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use foris_core::exec;
use foris_core::locks::{LockMode, LOCK_I2C};
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::registry::{ActionSpec, HandlerError, HandlerReply, ModuleDescriptor, ModuleHandler};
use crate::state::DaemonContext;

// Reads of the crypto chip and the thermometer share the i2c bus, so
// `get` serializes on the i2c write lock.
static ACTIONS: &[ActionSpec] = &[ActionSpec {
    name: "get",
    notification: false,
    requestable: true,
    lock: Some((LOCK_I2C, LockMode::Write)),
}];

const SCHEMA: &str = r#"{
    "module": "about",
    "actions": {
        "get": {
            "reply": {
                "type": "object",
                "properties": {
                    "model": {"type": "string"},
                    "serial": {"type": "string"},
                    "hostname": {"type": "string"},
                    "kernel": {"type": "string"},
                    "os_version": {"type": "string"},
                    "temperature": {
                        "type": "object",
                        "properties": {"CPU": {"type": "integer"}},
                        "required": ["CPU"],
                        "additionalProperties": false
                    }
                },
                "required": [
                    "model", "serial", "hostname", "kernel",
                    "os_version", "temperature"
                ],
                "additionalProperties": false
            }
        }
    }
}"#;

pub static DESCRIPTOR: ModuleDescriptor = ModuleDescriptor {
    name: "about",
    actions: ACTIONS,
    schema: SCHEMA,
};

/// Production variant reading `/proc`, sysfs and the crypto chip.
pub struct OpenwrtAbout {
    context: Arc<DaemonContext>,
}

impl OpenwrtAbout {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    fn read_or_unknown(&self, path: &str) -> String {
        match self.context.files.read_to_string(Path::new(path)) {
            Ok(content) => content.trim().to_string(),
            Err(error) => {
                warn!(path, %error, "device info read failed");
                "unknown".to_string()
            }
        }
    }

    async fn serial(&self) -> String {
        match exec::run(Path::new("/usr/bin/atsha204cmd"), &["serial-number"], None).await {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            Ok(output) => {
                warn!(exit_code = output.exit_code, "serial-number command failed");
                "unknown".to_string()
            }
            Err(error) => {
                warn!(%error, "serial-number command unavailable");
                "unknown".to_string()
            }
        }
    }

    fn temperature(&self) -> i64 {
        self.context
            .files
            .read_to_string(Path::new("/sys/class/thermal/thermal_zone0/temp"))
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map_or(0, |millis| millis / 1000)
    }
}

#[async_trait]
impl ModuleHandler for OpenwrtAbout {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        _action: &str,
        _data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        let kernel_re = Regex::new(r"Linux version (\S+)").map_err(|e| {
            HandlerError::Internal(format!("kernel version pattern: {e}"))
        })?;
        let kernel = self
            .context
            .files
            .extract(Path::new("/proc/version"), &kernel_re)
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(HandlerReply::new(json!({
            "model": self.read_or_unknown("/tmp/sysinfo/model"),
            "serial": self.serial().await,
            "hostname": self.read_or_unknown("/proc/sys/kernel/hostname"),
            "kernel": kernel,
            "os_version": self.read_or_unknown("/etc/turris-version"),
            "temperature": {"CPU": self.temperature()},
        })))
    }
}

/// Mock variant with fixed values.
pub struct MockAbout {
    context: Arc<DaemonContext>,
}

impl MockAbout {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }
}

#[async_trait]
impl ModuleHandler for MockAbout {
    fn descriptor(&self) -> &'static ModuleDescriptor {
        &DESCRIPTOR
    }

    async fn handle(
        &self,
        _action: &str,
        _data: Option<&Value>,
    ) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::new(json!({
            "model": "Turris Omnia",
            "serial": self.context.controller_id.clone(),
            "hostname": "turris",
            "kernel": "6.6.52",
            "os_version": "7.0.2",
            "temperature": {"CPU": 54},
        })))
    }
}
