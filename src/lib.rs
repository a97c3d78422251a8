pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod metrics;
pub mod pet;
pub mod rate_limit;
