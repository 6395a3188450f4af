//! DataFusion-based read path.

pub mod builders;
pub mod engine;

pub use builders::{
    FiltersQueryBuilder, MetricsNamesQueryBuilder, ObjectDetailsQueryBuilder, ReportQueryBuilder,
};
pub use engine::QueryEngine;
