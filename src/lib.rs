//! History cleanup library exports

pub mod builder;
pub mod clock;
pub mod config;
pub mod db;
pub mod deleter;
pub mod error;
pub mod models;
pub mod report;
pub mod routes;
pub mod state;
pub mod store;
pub mod tasks;
pub mod window;
