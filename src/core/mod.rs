//! Core engine — types, registry, resolution, journaling, planning, execution.

pub mod config;
pub mod error;
pub mod executor;
pub mod journal;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod types;
