//! Persistent state: layout, settings and the progress store

pub mod json_store;
pub mod layout;
pub mod settings;
pub mod store;
