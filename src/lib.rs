pub mod archive;
pub mod catalog;
pub mod client;
pub mod config;
pub mod errors;
pub mod jobs;

pub mod database;
pub mod server;
pub mod services;
