//! Caching and loan-analytics core of a library catalog backend.

pub mod analytics;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod model;
pub mod pipeline;
pub mod repository;
pub mod service;
pub mod store;
pub mod telemetry;

pub use analytics::{AnalyticsAggregator, AnalyticsReport, AnalyticsService};
pub use cache::{BookCache, EntityCache, MemberCache, MembershipFilter};
pub use config::CatalogConfig;
pub use context::RequestContext;
pub use error::{CatalogError, QueueError, StoreError};
pub use model::{Book, Loan, Member};
pub use service::{CatalogService, Repositories};
pub use store::{InMemoryStore, KeyValueStore, SharedStore};
