//! Domain models

pub mod progress;
pub mod website;
