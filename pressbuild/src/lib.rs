//! Pressbuild Library
//!
//! Provisions WordPress sites on remote servers: a build phase followed by a
//! certificate phase, with resumable progress kept in a versioned store.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod notify;
pub mod probe;
pub mod server;
pub mod session;
pub mod storage;
pub mod utils;
pub mod workers;
