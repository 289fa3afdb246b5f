pub mod cart;
pub mod item;
pub mod notification;
pub mod push_token;
pub mod user;
