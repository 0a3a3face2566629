//! Basic-auth credentials.

pub mod passwd;
