//! # sluice-core
//!
//! Core primitives for the Sluice distributed workflow engine.
//!
//! This crate provides the foundational types used across all Sluice components:
//!
//! - **Identifiers**: Strongly-typed IDs for DAGs, DAG instances, and task instances
//! - **Id Generation**: A worker-seeded, monotonic 64-bit id generator
//! - **Worker Keys**: Parsing and validation of cluster worker identities
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap shared by every worker process
//!
//! ## Crate Boundary
//!
//! `sluice-core` is the **only** crate allowed to define shared primitives.
//! The engine crate (`sluice-flow`) and any store or keeper backend build on
//! the types defined here.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::id::{IdGenerator, IdMinter};
//! use sluice_core::worker::parse_worker_number;
//!
//! let number = parse_worker_number("worker-1").unwrap();
//! let ids = IdGenerator::new(number);
//! let id = ids.next_string_id();
//! assert!(!id.is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod worker;

pub use error::{Error, Result};
pub use id::{DagId, DagInstanceId, IdGenerator, IdMinter, TaskInstanceId};
pub use worker::parse_worker_number;
