//! Model metadata.

pub mod catalog;

pub use catalog::{Backend, Catalog, LatencyRange, ModelDescriptor, Workflow};
