//! foris-daemon - Router-management control plane.
//!
//! The daemon exposes a uniform, schema-validated request/reply and
//! publish/subscribe API over three interchangeable transports. Clients
//! address structured messages to a module and action; the daemon
//! validates them, dispatches to the owning module's handler and fans
//! notifications out to every subscriber.
//!
//! # Modules
//!
//! - [`registry`]: module table, dispatch middleware chain, error
//!   mapping
//! - [`hub`]: bounded notification fan-out
//! - [`modules`]: the business modules with production/mock handler
//!   variants
//! - [`federation`]: subordinate enrollment, bridge files, tree
//!   invariants
//! - [`advertize`]: the periodic advertisement loop
//! - [`transports`]: unix socket, system RPC bus and pub/sub broker
//!   bindings
//! - [`state`]: the shared daemon context handed to every handler

pub mod advertize;
pub mod federation;
pub mod hub;
pub mod modules;
pub mod registry;
pub mod state;
pub mod transports;
