//! Integration-level unit tests

mod support;
mod test_fsm;
mod test_orchestrator;
mod test_reaper;
mod test_server;
