//! pushdeploy
//!
//! Push-to-deploy orchestration for remote hosts: validated deployment plans,
//! retrying step execution over SSH, per-host locking, rollback on failure and
//! an append-only run ledger.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
