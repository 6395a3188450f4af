//! Wire contract for the query analytics (QAN) services.
//!
//! This crate defines the protobuf messages exchanged with QAN agents and
//! analytics clients, together with the tonic server glue for the two gRPC
//! services:
//!
//! - `qan.v1.Collector`: agents push aggregated query metrics
//! - `qan.v1.Analytics`: clients read persisted aggregates
//!
//! Messages also derive serde so the HTTP/JSON gateway can decode request
//! bodies into exactly the same types the gRPC services consume.
//!
//! # Example
//!
//! ```ignore
//! use qan_proto::collector::{Collector, CollectorServer};
//!
//! let server = tonic::transport::Server::builder()
//!     .add_service(CollectorServer::new(my_receiver));
//! ```

pub mod analytics;
pub mod collector;
mod rpc;

pub use analytics::{Analytics, AnalyticsServer};
pub use collector::{Collector, CollectorServer};

/// Protobuf package shared by all QAN services.
pub const PACKAGE: &str = "qan.v1";
