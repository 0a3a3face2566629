//! Notifier implementations, one per transport.

pub mod email;
pub mod noop;
pub mod webhook;
