//! spaced core library: domain types, lifecycle contract, configuration,
//! caller identity and errors shared by every other crate.
//!
//! - [`types`]: entries, watch events, node health
//! - [`lifecycle`]: [`Component`], [`AsyncComponent`], readiness gate
//! - [`filter`]: hidden/system entry predicates
//! - [`config`]: `~/.spaced/config.yaml` load / save / validate
//! - [`permissions`] / [`secrets`]: app tokens and the secret store seam
//! - [`context`]: per-request caller, cancellation and deadline

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod permissions;
pub mod secrets;
pub mod types;

pub use config::{CacheConfig, DaemonConfig, LogConfig, NodeConfig, WatcherConfig};
pub use context::RequestContext;
pub use error::{AuthError, ConfigError, GateError, Interrupted, SecretStoreError};
pub use filter::{platform_filter, EntryAttributes, PathFilter};
pub use lifecycle::{AsyncComponent, Component, ReadinessGate, ReadinessHandle};
pub use permissions::{Access, AppToken, Caller, Grant, TokenAuthority};
pub use secrets::{MemorySecretStore, SecretStore};
pub use types::{ContentId, DirEntry, EntryKind, NodeHealth, NodeState, WatchEvent};
