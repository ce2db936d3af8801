pub mod aggregator;
pub mod app_context;
pub mod config;
pub mod health;
pub mod metric_consts;
pub mod recommendations;
pub mod server;
pub mod sink;
pub mod source;
pub mod store;
pub mod types;
pub mod vector;
pub mod workers;
