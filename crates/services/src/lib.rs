//! Dynamic service orchestration.
//!
//! A [`DynamicService`] wraps one git-hosted (or local) executable: it is
//! cloned and set up on first use, re-synced once per process epoch or
//! refresh interval, and its output optionally cached on disk. The
//! [`ServiceManager`] routes calls to built-in and dynamic services and runs
//! the periodic maintenance sweep that pre-warms caches on a cron schedule.

pub mod command;
pub mod dynamic;
pub mod manager;
pub mod process;
pub mod schedule;
pub mod service;
pub mod state;

pub use {
    command::{CommandContext, CommandDispatcher, CommandDoc},
    dynamic::DynamicService,
    manager::{MANAGER_SCOPE, ServiceManager},
    process::CommandRunner,
    service::Service,
    state::{FileStateStore, InMemoryStateStore, StateKey, StateStore},
};
