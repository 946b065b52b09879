//! Transport bindings.
//!
//! All three transports share the envelope vocabulary; they differ in
//! framing, addressing and subscription model:
//!
//! - [`unix_socket`]: length-prefixed JSON frames on a unix-domain
//!   stream socket
//! - [`ubus`]: the system RPC bus, one object per module
//! - [`mqtt`]: the pub/sub broker with per-controller topic namespaces
//!
//! Every binding takes a `watch::Receiver<bool>` shutdown signal: when
//! it flips to `true` the binding stops accepting work, drains and
//! returns.

pub mod mqtt;
pub mod ubus;
pub mod unix_socket;
