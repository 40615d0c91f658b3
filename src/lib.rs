//! Labflow — scheduling and resource allocation for lab workflows.

pub mod artifacts;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod resource;
pub mod runnable;
pub mod scheduler;
pub mod store;
pub mod submit;
