// API module organization
pub mod config;
pub mod middleware;
pub mod models;
pub mod plugins;
pub mod routes;
pub mod services;
pub mod storage;
