//! Deckhand - reconciliation worker for Kubernetes deployments
//!
//! Deckhand drains a queue of deployment tasks and converges each declared
//! service onto its cluster:
//!
//! - Namespace per application
//! - Registry pull secrets
//! - Deployment with probes, resources and rolling-update bounds
//! - ClusterIP service
//! - Ingress for services with a public URL
//!
//! Credentials are stored encrypted and only decrypted immediately before use.

pub mod cluster;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod naming;
pub mod reconcile;
pub mod store;
pub mod task;

pub use error::{DeckhandError, Result};
