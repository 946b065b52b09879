//! Shared fixtures for the integration suite: a mock-backed daemon
//! context plus registry, and a token builder matching the enrollment
//! wire format.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use foris_core::files::FileStore;
use foris_core::locks::LockBackend;
use foris_daemon::modules;
use foris_daemon::registry::Registry;
use foris_daemon::state::{Backend, DaemonContext, MOCK_CONTROLLER_ID};
use serde_json::json;

/// Mock daemon wired like the real startup path, with the file store
/// rooted in a fresh sandbox.
pub struct MockDaemon {
    pub context: Arc<DaemonContext>,
    pub registry: Arc<Registry>,
    pub sandbox: tempfile::TempDir,
}

#[must_use]
pub fn mock_daemon() -> MockDaemon {
    let sandbox = tempfile::tempdir().expect("sandbox creation failed");
    let context = DaemonContext::with_files(
        MOCK_CONTROLLER_ID.to_string(),
        Backend::Mock,
        false,
        LockBackend::InProcess,
        FileStore::with_root(sandbox.path()),
    );
    let handlers = modules::build(&context, None).expect("module build failed");
    let registry = Registry::new(
        handlers,
        context.hub.clone(),
        Arc::clone(&context.locks),
        false,
    )
    .expect("registry build failed");
    MockDaemon {
        context,
        registry: Arc::new(registry),
        sandbox,
    }
}

/// Build an enrollment token the way a subordinate node would.
#[must_use]
pub fn encode_token(device_id: &str, port: u16) -> String {
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
        header
            .set_path(format!("token-dir/{name}"))
            .expect("token member path");
        header.set_size(content.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append(&header, content.as_bytes())
            .expect("token member append");
    }
    let gz = builder.into_inner().expect("tar finalize");
    let compressed = gz.finish().expect("gzip finalize");
    base64::engine::general_purpose::STANDARD.encode(compressed)
}
