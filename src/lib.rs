// Public API for integration tests and embedding the hub

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod state;
pub mod ws;
