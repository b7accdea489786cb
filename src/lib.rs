//! Collaborative code rooms with a shared, bounded queue of sandboxed
//! compile-and-run jobs.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod auth;
pub mod config;
pub mod connection;
pub mod deferred;
pub mod docs;
pub mod http_server;
pub mod identity;
pub mod names;
pub mod protocol;
pub mod queue;
pub mod room;
pub mod rooms;
pub mod sandbox;
pub mod state;
pub mod store;
pub mod task;
pub mod users;
pub mod watchdog;
