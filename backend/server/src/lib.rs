//! envlock server library.
//!
//! A zero-knowledge secrets manager: clients encrypt env bundles end-to-end
//! and the server stores only opaque wrapped-key material and ciphertext,
//! deciding who may fetch which blobs. The cryptographic key graph is
//! two-layer envelope encryption: a per-project root key (PRK) wrapped once
//! per member, and a per-env-version data key (DEK) wrapped by the PRK.

pub mod api;
pub mod audit;
pub mod auth;
pub mod authz;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod services;
