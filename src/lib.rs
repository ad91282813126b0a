pub mod backfill;
pub mod config;
pub mod connection;
pub mod database;
pub mod listener;
pub mod pricing;
pub mod projector;
pub mod services;
pub mod types;

pub use config::Config;
pub use database::Database;
pub use types::*;
