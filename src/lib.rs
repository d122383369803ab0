pub mod config;
pub mod error;
pub mod balancer;
pub mod client;
pub mod service;
pub mod work;
pub mod analytics;
pub mod utils;
