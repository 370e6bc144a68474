//! Grants, permissions, third-party identity binding and bearer tokens.
//!
//! Every call into a service is evaluated against a [`CallContext`] built by
//! [`GrantAuthority`], whether the caller logged in directly, presented a
//! bearer token, or was vouched for by a third-party gateway.

pub mod challenge;
pub mod context;
pub mod grant;
pub mod guard;
pub mod password;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod token;
pub mod types;

pub use {
    challenge::ThirdPartyAuthGateway,
    context::CallContext,
    grant::{join_grant, split_grant},
    guard::{GrantAuthority, Policy},
    store::AuthStore,
    store_memory::InMemoryAuthStore,
    store_sqlite::SqliteAuthStore,
    token::BearerTokenAuthority,
    types::{
        BearerTokenRecord, GATEKEEPER, GrantAssignment, THIRD_PARTY_GATEWAY, ThirdPartyAuthRequest,
        User,
    },
};
