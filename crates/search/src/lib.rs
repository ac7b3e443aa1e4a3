//! Fista Search
//!
//! Backend connectors, the connector pool and the streaming aggregation
//! engine that merges their results.

pub mod aggregation;
pub mod connectors;

pub use aggregation::{AggregationEngine, AggregationOutcome, AggregationStatus, Delta, ResultView};
pub use connectors::{create_connector, Connector, ConnectorPool};
