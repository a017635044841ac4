//! Provisioning runs: status machine, steps, blueprints and orchestration

pub mod blueprint;
pub mod executor;
pub mod fsm;
pub mod lease;
pub mod orchestrator;
pub mod recorder;
pub mod step;
