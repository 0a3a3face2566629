//! whd HTTP server library.
//!
//! Exposes the building blocks of the server (config, state, error
//! handling, routes, auth, TLS) so integration tests and the binary
//! entrypoint share them.

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod state;
pub mod tls;
