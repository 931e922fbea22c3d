// Control-plane API for connections, remote scopes, blueprints and pipelines
pub mod api;

// Re-export api modules at crate root (so routes can use crate::services, crate::models)
pub use api::config;
pub use api::middleware;
pub use api::models;
pub use api::plugins;
pub use api::routes;
pub use api::services;
pub use api::storage;
