pub mod collab;
pub mod config;
pub mod engine;
pub mod errors;
pub mod functions;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod resilience;
pub mod sandbox;
pub mod scoring_api;
pub mod storage;
