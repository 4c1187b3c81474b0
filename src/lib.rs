// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Pairing domain
pub mod batcher;
pub mod chat;
pub mod connection_manager;
pub mod health;
pub mod matchmaking;
pub mod profile;
pub mod rooms;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
