//! Alert-name to remediation mapping.

mod definition;
mod store;

pub use definition::{AlertDefinition, Severity};
pub use store::AlertConfigStore;
