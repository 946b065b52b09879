//! System RPC bus transport.
//!
//! Connects to the bus daemon's unix socket and registers one object per
//! module (`foris.<module>`, one method per action). Incoming `INVOKE`
//! frames decode to request envelopes, dispatch through the registry and
//! are answered with a `DATA` frame followed by a `STATUS` frame.
//! Notifications leave as bus events through the daemon's event object.
//!
//! Wire layout: an 8-byte message header (version, type, sequence,
//! peer) followed by one container blob attribute wrapping the message
//! attributes. See [`blob`] and [`blobmsg`] for the attribute codecs.
//!
//! Because bus deployments may run several sibling daemon processes
//! against the same external state, this transport is paired with the
//! cross-process lock backend at startup.

pub mod blob;
pub mod blobmsg;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use foris_core::Message;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::hub::SubscriptionFilter;
use crate::registry::Registry;

use blob::BlobAttr;

/// Protocol version spoken on the bus.
const UBUS_VERSION: u8 = 0;

// Message types.
const UBUS_MSG_HELLO: u8 = 0;
const UBUS_MSG_STATUS: u8 = 1;
const UBUS_MSG_DATA: u8 = 2;
const UBUS_MSG_INVOKE: u8 = 5;
const UBUS_MSG_ADD_OBJECT: u8 = 6;

// Attribute ids.
const UBUS_ATTR_STATUS: u8 = 1;
const UBUS_ATTR_OBJPATH: u8 = 2;
const UBUS_ATTR_OBJID: u8 = 3;
const UBUS_ATTR_METHOD: u8 = 4;
const UBUS_ATTR_SIGNATURE: u8 = 6;
const UBUS_ATTR_DATA: u8 = 7;
const UBUS_ATTR_NO_REPLY: u8 = 10;

/// Well-known object id of the bus daemon's event broker.
const UBUS_SYSTEM_OBJECT_EVENT: u32 = 1;

/// Event id the daemon's notifications ride under.
const NOTIFICATION_EVENT_ID: &str = "foris.notifications";

const UBUS_STATUS_OK: u32 = 0;

/// Default bus daemon socket.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/ubus.sock")
}

/// 8-byte bus message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UbusHeader {
    version: u8,
    msg_type: u8,
    seq: u16,
    peer: u32,
}

impl UbusHeader {
    fn encode(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.version;
        out[1] = self.msg_type;
        out[2..4].copy_from_slice(&self.seq.to_be_bytes());
        out[4..8].copy_from_slice(&self.peer.to_be_bytes());
        out
    }

    fn decode(raw: [u8; 8]) -> Self {
        Self {
            version: raw[0],
            msg_type: raw[1],
            seq: u16::from_be_bytes([raw[2], raw[3]]),
            peer: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

/// Encode a full message: header plus the attribute container.
fn encode_message(msg_type: u8, seq: u16, peer: u32, attrs: &[BlobAttr]) -> Vec<u8> {
    let container = BlobAttr::new(0, blob::encode_all(attrs));
    let mut out = Vec::with_capacity(8 + container.encoded_len());
    out.extend_from_slice(
        &UbusHeader {
            version: UBUS_VERSION,
            msg_type,
            seq,
            peer,
        }
        .encode(),
    );
    container.encode_into(&mut out);
    out
}

async fn read_message(
    reader: &mut OwnedReadHalf,
) -> anyhow::Result<(UbusHeader, Vec<BlobAttr>)> {
    let mut header_raw = [0u8; 8];
    reader
        .read_exact(&mut header_raw)
        .await
        .context("bus connection closed")?;
    let header = UbusHeader::decode(header_raw);

    let mut container_hdr = [0u8; 4];
    reader
        .read_exact(&mut container_hdr)
        .await
        .context("bus connection closed mid-message")?;
    let declared = (u32::from_be_bytes(container_hdr) & 0x00ff_ffff) as usize;
    if declared < blob::BLOB_HDR_LEN {
        bail!("bus message container shorter than its header");
    }
    let mut payload = vec![0u8; blob::align4(declared) - blob::BLOB_HDR_LEN];
    reader
        .read_exact(&mut payload)
        .await
        .context("bus connection closed mid-payload")?;
    payload.truncate(declared - blob::BLOB_HDR_LEN);
    let attrs = BlobAttr::decode_all(&payload)?;
    Ok((header, attrs))
}

fn find_attr<'a>(attrs: &'a [BlobAttr], id: u8) -> Option<&'a BlobAttr> {
    attrs.iter().find(|attr| attr.id == id)
}

fn attr_u32(attrs: &[BlobAttr], id: u8) -> Option<u32> {
    let attr = find_attr(attrs, id)?;
    let bytes: [u8; 4] = attr.payload.as_slice().try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn attr_string(attrs: &[BlobAttr], id: u8) -> Option<String> {
    let attr = find_attr(attrs, id)?;
    let trimmed = attr.payload.strip_suffix(&[0]).unwrap_or(&attr.payload);
    String::from_utf8(trimmed.to_vec()).ok()
}

fn string_attr(id: u8, value: &str) -> BlobAttr {
    let mut payload = value.as_bytes().to_vec();
    payload.push(0);
    BlobAttr::new(id, payload)
}

fn u32_attr(id: u8, value: u32) -> BlobAttr {
    BlobAttr::new(id, value.to_be_bytes().to_vec())
}

fn table_attr(id: u8, table: &Map<String, Value>) -> BlobAttr {
    BlobAttr::new(id, blobmsg::encode_table(table))
}

/// A decoded incoming invocation.
#[derive(Debug, PartialEq)]
struct InvokeRequest {
    objid: u32,
    method: String,
    data: Option<Value>,
    no_reply: bool,
}

fn parse_invoke(attrs: &[BlobAttr]) -> Option<InvokeRequest> {
    let objid = attr_u32(attrs, UBUS_ATTR_OBJID)?;
    let method = attr_string(attrs, UBUS_ATTR_METHOD)?;
    let data = match find_attr(attrs, UBUS_ATTR_DATA) {
        Some(attr) => {
            let table = blobmsg::decode_table(&attr.payload).ok()?;
            if table.is_empty() {
                None
            } else {
                Some(Value::Object(table))
            }
        }
        None => None,
    };
    let no_reply = attr_u32(attrs, UBUS_ATTR_NO_REPLY).unwrap_or(0) != 0;
    Some(InvokeRequest {
        objid,
        method,
        data,
        no_reply,
    })
}

struct BusWriter {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    seq: AtomicU16,
}

impl BusWriter {
    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.context("bus write failed")?;
        writer.flush().await.context("bus flush failed")?;
        Ok(())
    }
}

/// Serve the bus binding until `shutdown` flips.
pub async fn serve(
    socket_path: &Path,
    registry: Arc<Registry>,
    single: bool,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to bus socket '{}'", socket_path.display()))?;
    let (mut reader, write_half) = stream.into_split();
    let writer = Arc::new(BusWriter {
        writer: tokio::sync::Mutex::new(write_half),
        seq: AtomicU16::new(1),
    });

    // The daemon greets with HELLO carrying our client id.
    let (hello, _) = read_message(&mut reader).await?;
    if hello.msg_type != UBUS_MSG_HELLO {
        bail!("bus daemon did not greet with HELLO");
    }
    let client_id = hello.peer;
    info!(client_id, "connected to bus daemon");

    // Register one object per module and collect the assigned ids.
    let mut objects: HashMap<u32, &'static str> = HashMap::new();
    for module in registry.modules() {
        let mut signature = Map::new();
        for action in registry.actions(module).unwrap_or_default() {
            signature.insert(action.to_string(), Value::Object(Map::new()));
        }
        let seq = writer.next_seq();
        writer
            .send(encode_message(
                UBUS_MSG_ADD_OBJECT,
                seq,
                0,
                &[
                    string_attr(UBUS_ATTR_OBJPATH, &format!("foris.{module}")),
                    table_attr(UBUS_ATTR_SIGNATURE, &signature),
                ],
            ))
            .await?;
        // Registration replies arrive in order before any invocation.
        let (reply, attrs) = read_message(&mut reader).await?;
        if reply.msg_type != UBUS_MSG_STATUS
            || attr_u32(&attrs, UBUS_ATTR_STATUS).unwrap_or(UBUS_STATUS_OK) != UBUS_STATUS_OK
        {
            bail!("bus daemon refused object registration for '{module}'");
        }
        let Some(objid) = attr_u32(&attrs, UBUS_ATTR_OBJID) else {
            bail!("bus daemon assigned no object id for '{module}'");
        };
        objects.insert(objid, module);
        debug!(module, objid, "registered bus object");
    }
    let objects = Arc::new(objects);

    // Notifications leave as bus events.
    {
        let event_writer = Arc::clone(&writer);
        let subscription = registry.hub().subscribe(SubscriptionFilter::All);
        let mut event_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.recv() => {
                        if let Err(error) = send_event(&event_writer, client_id, &message).await {
                            debug!(%error, "bus event emission failed");
                        }
                    }
                    changed = event_shutdown.changed() => {
                        if changed.is_err() || *event_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = read_message(&mut reader) => {
                let (header, attrs) = message?;
                if header.msg_type != UBUS_MSG_INVOKE {
                    debug!(msg_type = header.msg_type, "ignoring bus message");
                    continue;
                }
                let Some(invoke) = parse_invoke(&attrs) else {
                    warn!("malformed invocation frame");
                    continue;
                };
                let registry = Arc::clone(&registry);
                let writer = Arc::clone(&writer);
                let objects = Arc::clone(&objects);
                let task = async move {
                    handle_invoke(&registry, &writer, &objects, header, invoke).await;
                };
                if single {
                    task.await;
                } else {
                    tokio::spawn(task);
                }
            }
        }
    }
    info!("bus transport stopped");
    Ok(())
}

async fn handle_invoke(
    registry: &Registry,
    writer: &BusWriter,
    objects: &HashMap<u32, &'static str>,
    header: UbusHeader,
    invoke: InvokeRequest,
) {
    let Some(module) = objects.get(&invoke.objid) else {
        warn!(objid = invoke.objid, "invocation for unknown object");
        return;
    };
    let request = Message::request(module, &invoke.method, invoke.data.clone());
    let reply = registry.dispatch(request).await;
    if invoke.no_reply {
        return;
    }
    let reply_table = match serde_json::to_value(&reply) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let data_frame = encode_message(
        UBUS_MSG_DATA,
        header.seq,
        header.peer,
        &[
            u32_attr(UBUS_ATTR_OBJID, invoke.objid),
            table_attr(UBUS_ATTR_DATA, &reply_table),
        ],
    );
    let status_frame = encode_message(
        UBUS_MSG_STATUS,
        header.seq,
        header.peer,
        &[
            u32_attr(UBUS_ATTR_OBJID, invoke.objid),
            u32_attr(UBUS_ATTR_STATUS, UBUS_STATUS_OK),
        ],
    );
    if let Err(error) = writer.send(data_frame).await {
        warn!(%error, "invocation reply failed");
        return;
    }
    if let Err(error) = writer.send(status_frame).await {
        warn!(%error, "invocation status failed");
    }
}

/// Emit one notification envelope as a bus event.
async fn send_event(writer: &BusWriter, client_id: u32, message: &Message) -> anyhow::Result<()> {
    let envelope = match serde_json::to_value(message) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut event = Map::new();
    event.insert(
        "id".to_string(),
        Value::String(format!("{NOTIFICATION_EVENT_ID}.{}", message.module)),
    );
    event.insert("data".to_string(), Value::Object(envelope));
    let seq = writer.next_seq();
    writer
        .send(encode_message(
            UBUS_MSG_INVOKE,
            seq,
            client_id,
            &[
                u32_attr(UBUS_ATTR_OBJID, UBUS_SYSTEM_OBJECT_EVENT),
                string_attr(UBUS_ATTR_METHOD, "send"),
                table_attr(UBUS_ATTR_DATA, &event),
            ],
        ))
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn header_round_trip() {
        let header = UbusHeader {
            version: UBUS_VERSION,
            msg_type: UBUS_MSG_INVOKE,
            seq: 0xBEEF,
            peer: 0xDEAD_0001,
        };
        assert_eq!(UbusHeader::decode(header.encode()), header);
    }

    #[test]
    fn invoke_frames_decode() {
        let data = json!({"language": "cs"});
        let frame = encode_message(
            UBUS_MSG_INVOKE,
            7,
            42,
            &[
                u32_attr(UBUS_ATTR_OBJID, 11),
                string_attr(UBUS_ATTR_METHOD, "set_language"),
                table_attr(UBUS_ATTR_DATA, data.as_object().unwrap()),
            ],
        );
        // Strip the header and container by decoding the way the reader
        // does.
        let header = UbusHeader::decode(frame[..8].try_into().unwrap());
        assert_eq!(header.msg_type, UBUS_MSG_INVOKE);
        assert_eq!(header.seq, 7);
        let container = BlobAttr::decode_all(&frame[8..]).unwrap();
        assert_eq!(container.len(), 1);
        let attrs = BlobAttr::decode_all(&container[0].payload).unwrap();
        let invoke = parse_invoke(&attrs).unwrap();
        assert_eq!(
            invoke,
            InvokeRequest {
                objid: 11,
                method: "set_language".to_string(),
                data: Some(json!({"language": "cs"})),
                no_reply: false,
            }
        );
    }

    #[test]
    fn invoke_without_data_has_none() {
        let frame = encode_message(
            UBUS_MSG_INVOKE,
            1,
            1,
            &[
                u32_attr(UBUS_ATTR_OBJID, 3),
                string_attr(UBUS_ATTR_METHOD, "get"),
            ],
        );
        let container = BlobAttr::decode_all(&frame[8..]).unwrap();
        let attrs = BlobAttr::decode_all(&container[0].payload).unwrap();
        let invoke = parse_invoke(&attrs).unwrap();
        assert_eq!(invoke.method, "get");
        assert_eq!(invoke.data, None);
    }

    #[test]
    fn missing_method_rejects_invocation() {
        let attrs = vec![u32_attr(UBUS_ATTR_OBJID, 3)];
        assert!(parse_invoke(&attrs).is_none());
    }
}
