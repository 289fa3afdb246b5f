pub mod auth;
pub mod cart;
pub mod error;
pub mod items;
pub mod market_events;
pub mod notifications;
pub mod notifier;
pub mod password_reset;
pub mod push_tokens;
pub mod users;
