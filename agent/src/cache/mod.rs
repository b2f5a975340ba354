//! In-memory caches

pub mod plans;
