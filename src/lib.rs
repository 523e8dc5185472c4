//! Server-side metadata and byte-range coordination core for a parallel
//! distributed filesystem.
//!
//! Four engines cooperate here. The [`lock`] manager arbitrates overlapping
//! byte-range access per object with interval trees. The [`keyval`] store
//! indexes `(object, type, key)` records over an abstract ordered engine
//! and supports restart-safe iteration. The [`security`] caches keep
//! verified capabilities, credentials, and revocations hot. The [`sid`]
//! catalog tracks every known server with attribute and role indexes and
//! drives policy-based placement of new objects. The [`wire`] module
//! carries the codec the transport layer speaks.
//!
//! The RPC and job layers, the storage engine's durable backend, and the
//! transport itself are collaborators behind the traits in [`store`],
//! [`sid`], and [`job`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod chains;
pub mod config;
pub mod error;
pub mod itree;
pub mod job;
pub mod keyval;
pub mod lock;
pub mod rbmap;
pub mod security;
pub mod sid;
pub mod store;
pub mod types;
pub mod wire;

pub use crate::config::Tuning;
pub use crate::error::{Error, Result};
pub use crate::types::{DsAttributes, FsId, ObjectRef, Oid, ReqId, Sid};
