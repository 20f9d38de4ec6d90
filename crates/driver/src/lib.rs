//! Workload driver service: configuration and HTTP API

pub mod api;
pub mod config;
