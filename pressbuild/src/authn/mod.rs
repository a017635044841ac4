//! Credential resolution

pub mod credentials;
