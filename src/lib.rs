pub mod auth;
pub mod broadcast;
pub mod config;
pub mod database;
pub mod error;
pub mod error_handler;
pub mod locks;
pub mod memory_store;
pub mod model;
pub mod reconcile;
pub mod resolver;
pub mod routes;
pub mod store;
pub mod sync;
pub mod transfer;
