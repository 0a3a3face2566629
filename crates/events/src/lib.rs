//! Notification transports for terminal hook executions.
//!
//! Every transport implements [`whd_core::Notifier`] and is selected from a
//! notification URI (see [`uri`]):
//!
//! - [`SmtpNotifier`]: plain-text email over SMTP (`smtp:` scheme).
//! - [`HttpNotifier`]: JSON `POST` with retry (`http:` / `https:`).
//! - [`NoopNotifier`]: anything else.

pub mod delivery;
pub mod uri;

pub use delivery::email::{SmtpConfig, SmtpNotifier};
pub use delivery::noop::NoopNotifier;
pub use delivery::webhook::HttpNotifier;
pub use uri::{build_notifier, UriError};
