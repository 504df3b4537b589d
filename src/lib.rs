//! NFT collateral valuation and loan-terms attestation.
//!
//! The binary in `main.rs` wires the production collaborators; tests wire fakes
//! through the same constructors.

pub mod api;
pub mod attestation;
pub mod cache;
pub mod chain;
pub mod collections;
pub mod config;
pub mod datasource;
pub mod error;
pub mod ledger;
pub mod metadata;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod resolver;
pub mod signer;
pub mod store;
pub mod terms;
pub mod value;

pub use error::{OracleError, Result};
