pub mod chat;
pub mod health;
