pub mod api_error;
pub mod config;
pub mod db;
pub mod http;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub mod testing;
