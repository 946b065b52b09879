//! Unix-domain stream socket transport.
//!
//! Wire format: 4-byte big-endian length followed by the UTF-8 JSON
//! envelope. The length is the JSON byte count; a zero-length frame is
//! invalid and closes the connection. Maximum frame size is 16 MiB,
//! validated before allocation.
//!
//! Each accepted connection is served by its own task; reads and writes
//! on one connection are serialized, so replies leave in request order.
//! A connection's first frame selects its role: a request envelope makes
//! it a request/reply connection, a subscription frame
//! (`{"subscription": "all"}` or `{"subscription": [{"module": …,
//! "action": …}, …]}`) turns it into a notification stream that runs
//! until the client disconnects.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use foris_core::Message;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::hub::SubscriptionFilter;
use crate::registry::Registry;

/// Maximum frame size accepted on the socket.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Bind `path` and serve until `shutdown` flips.
pub async fn serve(
    path: &Path,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // A stale socket file from a previous run would fail the bind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket '{}'", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory '{}'", parent.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket '{}'", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict socket '{}'", path.display()))?;
    info!(path = %path.display(), "unix socket transport listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            handle_connection(stream, registry).await;
                        });
                    }
                    Err(error) => warn!(%error, "accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("unix socket transport stopped");
    Ok(())
}

async fn handle_connection(stream: UnixStream, registry: Arc<Registry>) {
    let mut framed = Framed::new(stream, codec());
    while let Some(frame) = framed.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "connection framing error");
                return;
            }
        };
        if bytes.is_empty() {
            warn!("zero-length frame; closing connection");
            return;
        }
        if let Some(filter) = parse_subscription(&bytes) {
            stream_notifications(framed, registry, filter).await;
            return;
        }
        let reply = registry.dispatch_raw(&bytes).await;
        let Ok(encoded) = reply.to_vec() else {
            warn!("reply serialization failed; closing connection");
            return;
        };
        if let Err(error) = framed.send(Bytes::from(encoded)).await {
            debug!(%error, "client went away mid-reply");
            return;
        }
    }
}

/// Interpret a frame as a subscription request, if it is one.
fn parse_subscription(bytes: &[u8]) -> Option<SubscriptionFilter> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let subscription = value.get("subscription")?;
    if subscription.as_str() == Some("all") {
        return Some(SubscriptionFilter::All);
    }
    let entries = subscription.as_array()?;
    let mut pairs = HashSet::new();
    for entry in entries {
        let module = entry.get("module")?.as_str()?;
        let action = entry.get("action")?.as_str()?;
        pairs.insert((module.to_string(), action.to_string()));
    }
    Some(SubscriptionFilter::Selected(pairs))
}

async fn stream_notifications(
    mut framed: Framed<UnixStream, LengthDelimitedCodec>,
    registry: Arc<Registry>,
    filter: SubscriptionFilter,
) {
    let subscription = registry.hub().subscribe(filter);
    debug!("subscription connection established");
    loop {
        let message = subscription.recv().await;
        let Ok(encoded) = message.to_vec() else {
            continue;
        };
        if framed.send(Bytes::from(encoded)).await.is_err() {
            debug!("subscriber disconnected");
            return;
        }
    }
}

/// Send one request over the socket and await its reply. Used by client
/// tooling and the test suite.
pub async fn client_request(path: &Path, message: &Message) -> anyhow::Result<Message> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to '{}'", path.display()))?;
    let mut framed = Framed::new(stream, codec());
    framed.send(Bytes::from(message.to_vec()?)).await?;
    let frame = framed
        .next()
        .await
        .context("connection closed before reply")??;
    Ok(Message::from_slice(&frame)?)
}

/// Open a subscription connection with the given filter and return the
/// framed stream of notification envelopes.
pub async fn client_subscribe(
    path: &Path,
    filter: &Value,
) -> anyhow::Result<Framed<UnixStream, LengthDelimitedCodec>> {
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("failed to connect to '{}'", path.display()))?;
    let mut framed = Framed::new(stream, codec());
    framed
        .send(Bytes::from(serde_json::to_vec(filter)?))
        .await?;
    Ok(framed)
}

/// Path of the default production socket.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/foris-controller.sock")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscription_frames_parse() {
        assert!(matches!(
            parse_subscription(br#"{"subscription": "all"}"#),
            Some(SubscriptionFilter::All)
        ));
        let selected = parse_subscription(
            br#"{"subscription": [{"module": "dns", "action": "update_settings"}]}"#,
        );
        assert!(matches!(selected, Some(SubscriptionFilter::Selected(_))));
        assert!(parse_subscription(br#"{"module": "dns"}"#).is_none());
        assert!(parse_subscription(br#"{"subscription": [{"module": "dns"}]}"#).is_none());
    }

    #[test]
    fn frame_length_matches_wire_contract() {
        // 4-byte big-endian length prefix framing the JSON byte count.
        let mut codec = codec();
        let mut buffer = bytes::BytesMut::new();
        let payload = json!({"module": "about"}).to_string();
        tokio_util::codec::Encoder::encode(
            &mut codec,
            Bytes::from(payload.clone()),
            &mut buffer,
        )
        .unwrap();
        assert_eq!(&buffer[..4], &(payload.len() as u32).to_be_bytes()[..]);
        assert_eq!(&buffer[4..], payload.as_bytes());
    }
}
