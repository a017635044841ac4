//! Background workers

pub mod lease_reaper;
