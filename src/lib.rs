//! trustroot - certificate lifecycle controller for a cluster-internal trust root
//!
//! The operator serves its admission and conversion webhooks with a
//! self-signed CA and a leaf certificate kept in one Secret. This crate keeps
//! that material valid and makes sure every consumer trusts it.
//!
//! # Architecture
//!
//! Each reconciliation pass:
//! - reads the trust secret and decides whether the material must be rotated
//! - regenerates and persists CA and leaf together when it must
//! - pushes the CA bundle to the admission configurations and the CRD
//!   conversion block, and stamps every operator replica, all concurrently
//! - returns when the next pass is due
//!
//! Only the replica holding the leader lease runs passes.
//!
//! Every write is a read-modify-write conditioned on `resourceVersion` and
//! restarted on conflict, so nothing else that edits the same objects is lost.
//!
//! # Modules
//!
//! - [`controller`] - Reconciliation pass and kube-rs adapter
//! - [`pki`] - CA and leaf issuance, parsing and validation
//! - [`trust_store`] - Trust secret accessor
//! - [`rotation`] - Rotation decision and regeneration
//! - [`propagation`] - CA bundle fan-out to webhook consumers
//! - [`fleet`] - Sibling pod discovery and notification
//! - [`leader`] - Lease-based leader election
//! - [`schedule`] - Next reconciliation deadline
//! - [`retry`] - Conflict retry with backoff
//! - [`client`] - Kubernetes resource store
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod leader;
pub mod pki;
pub mod propagation;
pub mod retry;
pub mod rotation;
pub mod schedule;
pub mod telemetry;
pub mod trust_store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
