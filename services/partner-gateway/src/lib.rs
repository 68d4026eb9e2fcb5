pub mod config;
pub mod crypto;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod lock;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod partner_client;
pub mod queue;
pub mod repository;
pub mod services;
pub mod worker;

pub use config::Config;
pub use errors::{GatewayServiceError, Result};
