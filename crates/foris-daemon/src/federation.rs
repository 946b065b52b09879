//! Federation records and subordinate enrollment.
//!
//! A subordinate is enrolled from a *token*: base64(gzip(tar)) holding
//! exactly `token.crt`, `token.key`, `ca.crt` and `conf.json` under one
//! arbitrary top-level directory. Enrollment stages the four files under
//! the broker's bridges directory with mode `0600`, registers a
//! `subordinate` section in the broker config and restarts the broker so
//! the bridge activates. Failure at any step leaves no partial state:
//! the staged directory is removed before the error surfaces.
//!
//! Tree invariants enforced here (canonical for every caller):
//! controller IDs are unique across the node itself, subordinates and
//! subsubordinates; a subsubordinate's `via` must name an existing
//! subordinate (depth is capped at two); deleting a subordinate cascades
//! to all subsubordinates routed through it, in the same transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use flate2::read::GzDecoder;
use foris_core::files::FileError;
use foris_core::services::{FailPolicy, ServiceError, Verb};
use foris_core::uci::{parse_bool, store_bool, UciError};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::state::DaemonContext;

/// Broker config file the federation records live in.
pub const BROKER_CONFIG: &str = "fosquitto";
/// Broker init script restarted after bridge changes.
pub const BROKER_SERVICE: &str = "fosquitto";
/// Account the bridge files are chowned to.
pub const BROKER_USER: &str = "mosquitto";
/// Directory the per-subordinate bridge files land in.
pub const BRIDGES_DIR: &str = "/etc/fosquitto/bridges";

const TOKEN_MEMBERS: [&str; 4] = ["token.crt", "token.key", "ca.crt", "conf.json"];

/// Federation failures. Handlers map these to `{"result": false}`; they
/// never surface as wire errors.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("invalid subordinate token: {detail}")]
    InvalidToken { detail: String },
    #[error(transparent)]
    Uci(#[from] UciError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Addresses advertised inside a token's `conf.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpAddresses {
    #[serde(default)]
    pub wan: Vec<String>,
    #[serde(default)]
    pub lan: Vec<String>,
}

/// Payload of a token's `conf.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConf {
    pub device_id: String,
    pub hostname: String,
    #[serde(default)]
    pub ipv4_ips: IpAddresses,
    #[serde(default)]
    pub dhcp_names: Vec<String>,
    pub port: u16,
}

impl TokenConf {
    /// First available address, preferring WAN.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.ipv4_ips
            .wan
            .first()
            .or_else(|| self.ipv4_ips.lan.first())
            .map(String::as_str)
    }
}

/// Decoded enrollment token.
pub struct SubordinateToken {
    pub conf: TokenConf,
    /// The four member files, keyed by basename.
    pub files: BTreeMap<&'static str, Vec<u8>>,
}

impl SubordinateToken {
    /// Decode and structurally verify a base64(gzip(tar)) token.
    pub fn decode(encoded: &str) -> Result<Self, FederationError> {
        let invalid = |detail: &str| FederationError::InvalidToken {
            detail: detail.to_string(),
        };
        let compressed = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| invalid("not base64"))?;
        let mut archive = tar::Archive::new(GzDecoder::new(compressed.as_slice()));
        let mut files: BTreeMap<&'static str, Vec<u8>> = BTreeMap::new();
        let entries = archive
            .entries()
            .map_err(|_| invalid("not a gzipped tar archive"))?;
        for entry in entries {
            let mut entry = entry.map_err(|_| invalid("corrupt tar entry"))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|_| invalid("malformed member path"))?;
            let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
                return Err(invalid("malformed member path"));
            };
            let Some(member) = TOKEN_MEMBERS.iter().copied().find(|m| *m == basename) else {
                return Err(invalid("unexpected archive member"));
            };
            if files.contains_key(member) {
                return Err(invalid("duplicate archive member"));
            }
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|_| invalid("truncated archive member"))?;
            files.insert(member, content);
        }
        if files.len() != TOKEN_MEMBERS.len() {
            return Err(invalid("archive is missing members"));
        }
        let conf: TokenConf = serde_json::from_slice(&files["conf.json"])
            .map_err(|_| invalid("malformed conf.json"))?;
        if !is_controller_id(&conf.device_id) {
            return Err(invalid("device_id is not a 16-hex-digit identifier"));
        }
        Ok(Self { conf, files })
    }
}

/// Whether `value` is a well-formed controller identifier.
#[must_use]
pub fn is_controller_id(value: &str) -> bool {
    value.len() == 16 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// One subsubordinate in a listing.
#[derive(Debug, Clone)]
pub struct SubsubInfo {
    pub controller_id: String,
    pub enabled: bool,
    pub custom_name: String,
    pub via: String,
}

/// One subordinate in a listing, with its subsubordinates.
#[derive(Debug, Clone)]
pub struct SubordinateInfo {
    pub controller_id: String,
    pub enabled: bool,
    pub custom_name: String,
    pub subsubordinates: Vec<SubsubInfo>,
}

impl SubordinateInfo {
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "controller_id": self.controller_id,
            "enabled": self.enabled,
            "custom_name": self.custom_name,
            "subsubordinates": self
                .subsubordinates
                .iter()
                .map(|s| json!({
                    "controller_id": s.controller_id,
                    "enabled": s.enabled,
                    "custom_name": s.custom_name,
                    "via": s.via,
                }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Backend-independent federation operations.
///
/// Every mutation is called with the `subordinates` write lock already
/// held by the dispatch chain. Boolean returns are business outcomes:
/// `false` means the request was refused, not that something broke.
#[async_trait]
pub trait FederationStore: Send + Sync {
    async fn list(&self) -> Result<Vec<SubordinateInfo>, FederationError>;
    async fn add_sub(&self, token: &SubordinateToken) -> Result<bool, FederationError>;
    async fn del(&self, controller_id: &str) -> Result<bool, FederationError>;
    async fn set_enabled(&self, controller_id: &str, enabled: bool)
        -> Result<bool, FederationError>;
    async fn update_sub(&self, controller_id: &str, custom_name: &str)
        -> Result<bool, FederationError>;
    async fn add_subsub(&self, controller_id: &str, via: &str) -> Result<bool, FederationError>;
    async fn update_subsub(
        &self,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError>;
    async fn del_subsub(&self, controller_id: &str) -> Result<bool, FederationError>;
}

fn bridge_dir(controller_id: &str) -> PathBuf {
    Path::new(BRIDGES_DIR).join(controller_id)
}

/// Production store over the broker uci file and bridges directory.
pub struct OpenwrtFederation {
    context: Arc<DaemonContext>,
}

impl OpenwrtFederation {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    /// Every controller ID in the tree, including this node's own.
    async fn tree_ids(&self) -> Result<BTreeSet<String>, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let mut ids: BTreeSet<String> = BTreeSet::new();
        ids.insert(self.context.controller_id.clone());
        for section_type in ["subordinate", "subsubordinate"] {
            for section in tree.sections_by_type(section_type) {
                if let Some(name) = &section.name {
                    ids.insert(name.clone());
                }
            }
        }
        Ok(ids)
    }

    async fn restart_broker(&self) {
        if let Err(error) = self
            .context
            .services
            .run(BROKER_SERVICE, Verb::Restart, FailPolicy::Log)
            .await
        {
            warn!(%error, "broker restart failed after federation change");
        }
    }

    fn stage_files(&self, token: &SubordinateToken) -> Result<(), FederationError> {
        let dir = bridge_dir(&token.conf.device_id);
        for (name, content) in &token.files {
            let target = dir.join(name);
            if let Err(error) = self.context.files.write_atomic(&target, content, Some(0o600)) {
                // No partial state: whatever landed is removed again.
                if let Err(cleanup) = self.context.files.remove_dir_all(&dir) {
                    warn!(%cleanup, "failed to clean partially staged bridge directory");
                }
                return Err(error.into());
            }
        }
        self.context
            .files
            .chown_best_effort(&dir, BROKER_USER);
        Ok(())
    }
}

#[async_trait]
impl FederationStore for OpenwrtFederation {
    async fn list(&self) -> Result<Vec<SubordinateInfo>, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let mut subsubs: Vec<SubsubInfo> = Vec::new();
        for section in tree.sections_by_type("subsubordinate") {
            let Some(name) = &section.name else { continue };
            subsubs.push(SubsubInfo {
                controller_id: name.clone(),
                enabled: section
                    .option("enabled")
                    .and_then(|v| v.as_scalar())
                    .map_or(true, |v| parse_bool(v).unwrap_or(true)),
                custom_name: section
                    .option("custom_name")
                    .and_then(|v| v.as_scalar())
                    .unwrap_or("")
                    .to_string(),
                via: section
                    .option("via")
                    .and_then(|v| v.as_scalar())
                    .unwrap_or("")
                    .to_string(),
            });
        }
        let mut subordinates = Vec::new();
        for section in tree.sections_by_type("subordinate") {
            let Some(name) = &section.name else { continue };
            subordinates.push(SubordinateInfo {
                controller_id: name.clone(),
                enabled: section
                    .option("enabled")
                    .and_then(|v| v.as_scalar())
                    .map_or(true, |v| parse_bool(v).unwrap_or(true)),
                custom_name: section
                    .option("custom_name")
                    .and_then(|v| v.as_scalar())
                    .unwrap_or("")
                    .to_string(),
                subsubordinates: subsubs
                    .iter()
                    .filter(|s| s.via == *name)
                    .cloned()
                    .collect(),
            });
        }
        Ok(subordinates)
    }

    async fn add_sub(&self, token: &SubordinateToken) -> Result<bool, FederationError> {
        let id = token.conf.device_id.clone();
        if self.tree_ids().await?.contains(&id) {
            return Ok(false);
        }
        self.stage_files(token)?;

        let mut tx = self.context.uci.transaction();
        tx.add_section(BROKER_CONFIG, "subordinate", Some(&id))
            .set_option(BROKER_CONFIG, &id, "enabled", store_bool(true))
            .set_option(BROKER_CONFIG, &id, "custom_name", "")
            .set_option(BROKER_CONFIG, &id, "port", &token.conf.port.to_string());
        if let Some(address) = token.conf.address() {
            tx.set_option(BROKER_CONFIG, &id, "address", address);
        }
        if let Err(error) = tx.commit().await {
            // Roll the staged files back so no partial state survives.
            if let Err(cleanup) = self.context.files.remove_dir_all(&bridge_dir(&id)) {
                warn!(%cleanup, "failed to roll back staged bridge directory");
            }
            return Err(error.into());
        }
        self.restart_broker().await;
        Ok(true)
    }

    async fn del(&self, controller_id: &str) -> Result<bool, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let exists = tree
            .sections_by_type("subordinate")
            .iter()
            .any(|s| s.name.as_deref() == Some(controller_id));
        if !exists {
            return Ok(false);
        }
        let mut tx = self.context.uci.transaction();
        tx.del_section(BROKER_CONFIG, controller_id);
        // Cascade: everything routed through this subordinate goes with it.
        for section in tree.sections_by_type("subsubordinate") {
            let via = section.option("via").and_then(|v| v.as_scalar());
            if via == Some(controller_id) {
                if let Some(name) = &section.name {
                    tx.del_section(BROKER_CONFIG, name);
                }
            }
        }
        tx.commit().await?;
        if let Err(error) = self.context.files.remove_dir_all(&bridge_dir(controller_id)) {
            warn!(%error, controller_id, "bridge directory removal failed");
        }
        self.restart_broker().await;
        Ok(true)
    }

    async fn set_enabled(
        &self,
        controller_id: &str,
        enabled: bool,
    ) -> Result<bool, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let section = tree
            .sections
            .iter()
            .find(|s| {
                s.name.as_deref() == Some(controller_id)
                    && (s.section_type == "subordinate" || s.section_type == "subsubordinate")
            });
        if section.is_none() {
            return Ok(false);
        }
        let mut tx = self.context.uci.transaction();
        tx.set_option(BROKER_CONFIG, controller_id, "enabled", store_bool(enabled));
        tx.commit().await?;
        self.restart_broker().await;
        Ok(true)
    }

    async fn update_sub(
        &self,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError> {
        self.update_custom_name("subordinate", controller_id, custom_name)
            .await
    }

    async fn add_subsub(&self, controller_id: &str, via: &str) -> Result<bool, FederationError> {
        if self.tree_ids().await?.contains(controller_id) {
            return Ok(false);
        }
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        // Depth cap: the hop must be a direct subordinate.
        let via_is_subordinate = tree
            .sections_by_type("subordinate")
            .iter()
            .any(|s| s.name.as_deref() == Some(via));
        if !via_is_subordinate {
            return Ok(false);
        }
        let mut tx = self.context.uci.transaction();
        tx.add_section(BROKER_CONFIG, "subsubordinate", Some(controller_id))
            .set_option(BROKER_CONFIG, controller_id, "enabled", store_bool(true))
            .set_option(BROKER_CONFIG, controller_id, "custom_name", "")
            .set_option(BROKER_CONFIG, controller_id, "via", via);
        tx.commit().await?;
        Ok(true)
    }

    async fn update_subsub(
        &self,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError> {
        self.update_custom_name("subsubordinate", controller_id, custom_name)
            .await
    }

    async fn del_subsub(&self, controller_id: &str) -> Result<bool, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let exists = tree
            .sections_by_type("subsubordinate")
            .iter()
            .any(|s| s.name.as_deref() == Some(controller_id));
        if !exists {
            return Ok(false);
        }
        let mut tx = self.context.uci.transaction();
        tx.del_section(BROKER_CONFIG, controller_id);
        tx.commit().await?;
        Ok(true)
    }
}

impl OpenwrtFederation {
    async fn update_custom_name(
        &self,
        section_type: &str,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError> {
        let tree = self.context.uci.read(BROKER_CONFIG).await?;
        let exists = tree
            .sections_by_type(section_type)
            .iter()
            .any(|s| s.name.as_deref() == Some(controller_id));
        if !exists {
            return Ok(false);
        }
        let mut tx = self.context.uci.transaction();
        tx.set_option(BROKER_CONFIG, controller_id, "custom_name", custom_name);
        tx.commit().await?;
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct MockRecord {
    enabled: bool,
    custom_name: String,
    via: Option<String>,
}

/// Mock store: records in memory, bridge files staged through the rooted
/// file store (best effort) so enrollment tests can inspect them.
pub struct MockFederation {
    context: Arc<DaemonContext>,
    records: std::sync::Mutex<BTreeMap<String, MockRecord>>,
}

impl MockFederation {
    #[must_use]
    pub fn new(context: &Arc<DaemonContext>) -> Self {
        Self {
            context: Arc::clone(context),
            records: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    fn count_reload(&self) {
        self.context.mock.update("subordinates", |state| {
            let count = state["reloads"].as_u64().unwrap_or(0);
            state["reloads"] = json!(count + 1);
        });
    }

    fn tree_ids(&self) -> BTreeSet<String> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: BTreeSet<String> = records.keys().cloned().collect();
        ids.insert(self.context.controller_id.clone());
        ids
    }
}

#[async_trait]
impl FederationStore for MockFederation {
    async fn list(&self) -> Result<Vec<SubordinateInfo>, FederationError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut subordinates = Vec::new();
        for (id, record) in records.iter().filter(|(_, r)| r.via.is_none()) {
            subordinates.push(SubordinateInfo {
                controller_id: id.clone(),
                enabled: record.enabled,
                custom_name: record.custom_name.clone(),
                subsubordinates: records
                    .iter()
                    .filter(|(_, r)| r.via.as_deref() == Some(id))
                    .map(|(sub_id, r)| SubsubInfo {
                        controller_id: sub_id.clone(),
                        enabled: r.enabled,
                        custom_name: r.custom_name.clone(),
                        via: id.clone(),
                    })
                    .collect(),
            });
        }
        Ok(subordinates)
    }

    async fn add_sub(&self, token: &SubordinateToken) -> Result<bool, FederationError> {
        let id = token.conf.device_id.clone();
        if self.tree_ids().contains(&id) {
            return Ok(false);
        }
        let dir = bridge_dir(&id);
        for (name, content) in &token.files {
            if let Err(error) = self
                .context
                .files
                .write_atomic(&dir.join(name), content, Some(0o600))
            {
                warn!(%error, "mock bridge staging failed");
            }
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                MockRecord {
                    enabled: true,
                    custom_name: String::new(),
                    via: None,
                },
            );
        self.count_reload();
        Ok(true)
    }

    async fn del(&self, controller_id: &str) -> Result<bool, FederationError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let existed = records
            .get(controller_id)
            .is_some_and(|record| record.via.is_none());
        if !existed {
            return Ok(false);
        }
        records.remove(controller_id);
        records.retain(|_, record| record.via.as_deref() != Some(controller_id));
        drop(records);
        if let Err(error) = self.context.files.remove_dir_all(&bridge_dir(controller_id)) {
            warn!(%error, "mock bridge directory removal failed");
        }
        self.count_reload();
        Ok(true)
    }

    async fn set_enabled(
        &self,
        controller_id: &str,
        enabled: bool,
    ) -> Result<bool, FederationError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(controller_id) {
            Some(record) => {
                record.enabled = enabled;
                drop(records);
                self.count_reload();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_sub(
        &self,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(controller_id) {
            Some(record) if record.via.is_none() => {
                record.custom_name = custom_name.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_subsub(&self, controller_id: &str, via: &str) -> Result<bool, FederationError> {
        if self.tree_ids().contains(controller_id) {
            return Ok(false);
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        // Depth cap: the hop must be a direct subordinate.
        let via_is_subordinate = records
            .get(via)
            .is_some_and(|record| record.via.is_none());
        if !via_is_subordinate {
            return Ok(false);
        }
        records.insert(
            controller_id.to_string(),
            MockRecord {
                enabled: true,
                custom_name: String::new(),
                via: Some(via.to_string()),
            },
        );
        Ok(true)
    }

    async fn update_subsub(
        &self,
        controller_id: &str,
        custom_name: &str,
    ) -> Result<bool, FederationError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(controller_id) {
            Some(record) if record.via.is_some() => {
                record.custom_name = custom_name.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del_subsub(&self, controller_id: &str) -> Result<bool, FederationError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let existed = records
            .get(controller_id)
            .is_some_and(|record| record.via.is_some());
        if existed {
            records.remove(controller_id);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    /// Build a syntactically valid token the way an enrolling node would.
    pub(crate) fn encode_token(device_id: &str, port: u16) -> String {
        let conf = json!({
            "device_id": device_id,
            "hostname": "sub-turris",
            "ipv4_ips": {"wan": ["203.0.113.7"], "lan": ["192.168.1.1"]},
            "dhcp_names": [],
            "port": port,
        })
        .to_string();
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, content) in [
            ("token.crt", "certificate"),
            ("token.key", "private key"),
            ("ca.crt", "ca certificate"),
            ("conf.json", conf.as_str()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_path(format!("token-dir/{name}")).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        let gz = builder.into_inner().unwrap();
        let compressed = gz.finish().unwrap();
        base64::engine::general_purpose::STANDARD.encode(compressed)
    }

    #[test]
    fn token_round_trip() {
        let encoded = encode_token("1122334455667788", 11884);
        let token = SubordinateToken::decode(&encoded).unwrap();
        assert_eq!(token.conf.device_id, "1122334455667788");
        assert_eq!(token.conf.port, 11884);
        assert_eq!(token.conf.address(), Some("203.0.113.7"));
        assert_eq!(token.files.len(), 4);
        assert_eq!(token.files["ca.crt"], b"ca certificate");
    }

    #[test]
    fn token_rejects_garbage_and_short_ids() {
        assert!(matches!(
            SubordinateToken::decode("not-base64!!!"),
            Err(FederationError::InvalidToken { .. })
        ));
        let bad_id = encode_token("123", 11884);
        assert!(matches!(
            SubordinateToken::decode(&bad_id),
            Err(FederationError::InvalidToken { .. })
        ));
    }

    #[test]
    fn token_requires_all_four_members() {
        let conf = json!({"device_id": "1122334455667788", "hostname": "x", "port": 1});
        let mut builder =
            tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let content = conf.to_string();
        let mut header = tar::Header::new_gnu();
        header.set_path("t/conf.json").unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append(&header, content.as_bytes()).unwrap();
        let compressed = builder.into_inner().unwrap().finish().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
        assert!(matches!(
            SubordinateToken::decode(&encoded),
            Err(FederationError::InvalidToken { .. })
        ));
    }

    #[test]
    fn controller_id_shape() {
        assert!(is_controller_id("1122334455667788"));
        assert!(is_controller_id("aabbccddeeff0011"));
        assert!(!is_controller_id("112233445566778"));
        assert!(!is_controller_id("11223344556677zz"));
    }
}
