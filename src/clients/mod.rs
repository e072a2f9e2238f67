pub mod database;
pub mod events;
pub mod health;
pub mod host;
pub mod mail;
pub mod memory;
pub mod redis;
pub mod template;
