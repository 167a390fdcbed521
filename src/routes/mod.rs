pub mod chat;
pub mod internal;
pub mod models;
