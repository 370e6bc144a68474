//! Connection-facing entry points.
//!
//! A [`Gateway`] owns the session table and turns raw `call`/`message`
//! requests into authenticated [`mememo_auth::CallContext`]s routed through
//! the [`mememo_services::ServiceManager`]. Login (`auth`, `token`), the
//! third-party challenge flow (`auth3p`), `whoami` and `help` are answered
//! here; everything else goes to a built-in or dynamic service.

pub mod admin;
pub mod auth;
pub mod gateway;
pub mod session;

pub use {
    admin::{ADMIN, AdminService},
    auth::AuthServices,
    gateway::{Gateway, Reply},
    session::{Session, SessionTable},
};
