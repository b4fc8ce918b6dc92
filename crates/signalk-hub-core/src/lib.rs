//! # signalk-hub-core
//!
//! The canonical Signal K model and everything that reads or writes it.
//!
//! This crate provides:
//! - Data model types (Leaf, Delta, Update, SourceDescriptor)
//! - Path parsing, `self` resolution and wildcard matching
//! - The arena-backed canonical model
//! - Delta merging with per-value provenance
//! - GET / LIST queries over the safe projection
//! - Hub configuration
//!
//! This crate contains no async code and no I/O beyond reading the
//! configuration file; locking and scheduling live in `signalk-hub-server`.

pub mod config;
pub mod merger;
pub mod model;
pub mod path;
pub mod query;
pub mod store;

pub use config::{ConfigError, HubConfig};
pub use merger::{DeltaError, DeltaMerger, MergeReport};
pub use model::*;
pub use path::{Path, PathError, PathPattern, PathResolver, PatternError};
pub use query::{GetRequest, ListRequest, ListResponse};
pub use store::{NodeId, NodeKind, SignalKModel};
