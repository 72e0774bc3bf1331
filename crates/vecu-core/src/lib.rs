//! # vecu-core
//!
//! Core library for the vECU adaptive runtime - an AUTOSAR-Adaptive-style
//! platform for automotive ECUs.
//!
//! This crate provides the building blocks the Execution Manager and the
//! managed applications share:
//!
//! - **Persistency**: atomic key/value and file storage behind a registry of
//!   logical instance specifiers, with quota enforcement and a crash-safe
//!   write protocol
//! - **Communication**: a transport binding with service offer/request,
//!   event subscription lifecycles and availability fan-out, plus the
//!   transport-agnostic Proxy/Skeleton facade on top of it
//! - **Health Management**: per-application supervision cycles
//!   (alive + checkpoint evaluation) and the client that reports into them
//!
//! ## Example
//!
//! ```rust,no_run
//! use vecu_core::per::{StorageRegistry, open_key_value_storage};
//!
//! let registry = StorageRegistry::new();
//! registry.init_from_file("manifests/persistency.json")?;
//!
//! let kv = open_key_value_storage(&registry, "EM/KV/Settings")?;
//! kv.set_value("foo", b"bar")?;
//! # Ok::<(), vecu_core::per::PerError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod com;
pub mod per;
pub mod phm;
pub mod services;

/// Re-export commonly used types at the crate root.
pub use com::binding::Binding;
pub use com::{ComError, SubscriptionToken};
pub use per::{PerError, PerResult, StorageRegistry};
pub use phm::supervisor::PhmSupervisor;
