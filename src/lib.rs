pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod latest;
pub mod mqtt;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod store;
pub mod telemetry;
