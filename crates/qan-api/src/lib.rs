//! qan-api: query analytics ingestion and serving backend.
//!
//! Agents push per-query metric buckets over RPC. The service aggregates
//! them in memory for one flush window, persists the aggregates as
//! date-partitioned Parquet in object storage, and serves ranked reports
//! over both RPC and an HTTP/JSON gateway.
//!
//! ## Architecture
//!
//! ```text
//! Collector RPC → Ingester (bucket table) → Parquet → Object Storage
//!                                                        ↓
//!                                         DataFusion (ListingTable)
//!                                                        ↓
//!                                     Analytics RPC / JSON gateway
//! ```
//!
//! A retention pruner drops whole date partitions past the horizon, and
//! embedded migrations version the persisted table layout.

pub mod analytics;
pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod migrations;
pub mod model;
pub mod query;
pub mod receiver;
pub mod retention;
pub mod retry;
pub mod schema;
pub mod server;
pub mod storage;

#[cfg(test)]
pub mod test_fixtures;

pub use config::QanConfig;
pub use error::QanError;
