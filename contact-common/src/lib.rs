pub mod geo;
pub mod metrics;
pub mod store;
pub mod types;
