pub mod delivery;
pub mod evaluation;
pub mod event;
pub mod health;
pub mod lock;
pub mod notification;
pub mod retry;
pub mod template;
