//! Vector database access over Weaviate's REST and GraphQL endpoints

pub mod client;
pub mod query;

pub use client::{api_key_header, ClientManager, METADATA_COLLECTION};
pub use query::{class_name, AggregateQuery, Metric, PropertyMetrics, SearchQuery, SearchType, SortBy};
