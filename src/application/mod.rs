//! Application services: lease coordination, the worker pool and the render harness.

pub mod coordinator;
pub mod error;
pub mod reaper;
pub mod render;
pub mod repos;
pub mod worker;
