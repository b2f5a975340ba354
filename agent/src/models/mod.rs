//! Data models

pub mod host;
pub mod run;
