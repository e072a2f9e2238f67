pub mod api;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod lock;
pub mod models;
pub mod notifications;
pub mod store;
pub mod utils;
