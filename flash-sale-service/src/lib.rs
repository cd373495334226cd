pub mod api;
pub mod config;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod reservation;
pub mod schema;
pub mod service;
pub mod worker;

pub use pipeline::{Pipeline, PipelineConfig};
pub use service::OrderService;
pub use worker::WorkerStats;
