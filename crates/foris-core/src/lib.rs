//! foris-core - Transport-agnostic building blocks of the control plane.
//!
//! This crate carries everything the daemon needs that is independent of
//! any particular transport or business module:
//!
//! - [`message`]: the envelope vocabulary shared by every transport
//! - [`locks`]: named read/write locks with in-process and cross-process
//!   backends
//! - [`uci`]: transactional client for the external hierarchical config
//!   store
//! - [`services`]: init-script runner with failure policy
//! - [`files`]: rooted file store with atomic writes and regex extraction
//! - [`schema`]: JSON-schema composition and message validation
//! - [`async_cmd`]: async command runtime streaming child progress
//! - [`exec`]: external command invocation shared by the above
//! - [`env`]: sandbox environment overrides honoured across the crate

pub mod async_cmd;
pub mod env;
pub mod exec;
pub mod files;
pub mod locks;
pub mod message;
pub mod schema;
pub mod services;
pub mod uci;

pub use message::{ErrorCode, ErrorReport, Message, MessageKind, INCORRECT_INPUT_PREFIX};
