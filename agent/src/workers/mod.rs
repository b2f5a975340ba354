//! Background workers

pub mod plan_reloader;
