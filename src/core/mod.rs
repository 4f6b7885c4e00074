//! Core domain types: identifiers, job descriptors, environments and schedules.

pub mod environment;
pub mod job;
pub mod schedule;
pub mod types;
