pub mod accounts;
pub mod handler;
pub mod models;
pub mod notifications;
pub mod webhook;
