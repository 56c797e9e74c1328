//! NotiBridge Core Library
//!
//! Shared functionality for the notification mirroring core:
//! - Device and notification data model
//! - Wire frame parsing for the companion device protocol
//! - Per-device notification ingestion with identity dedup
//! - Filter rule engine (built-in predicates, package black/whitelists)
//! - Store interfaces, configuration and common error types

pub mod config;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod model;
pub mod protocol;
pub mod store;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use filter::{FilterRule, PackageFilterMode, RuleSet, RuleUpdate};
pub use ingest::{Counts, NotificationSet};
pub use model::{Device, IdentityKey, Notification, NotificationAction};
pub use store::{DeviceStore, FilterConfigStore, MemoryDeviceStore, MemoryFilterStore};
