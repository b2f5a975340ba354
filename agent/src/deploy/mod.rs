//! Deployment module

pub mod cancel;
pub mod credentials;
pub mod executor;
pub mod fsm;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod step_runner;
pub mod template;
