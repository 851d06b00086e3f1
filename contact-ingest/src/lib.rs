pub mod admission;
pub mod api;
pub mod auth;
pub mod config;
pub mod event;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod proximity;
pub mod retention;
pub mod router;
