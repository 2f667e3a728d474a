//! Tenant credential model, dual-storage backends, and the front-end
//! cache that sits in front of them.

pub mod cache;
pub mod record;
pub mod store;

pub use cache::{CacheConfig, CacheStats, CredentialCache};
pub use record::{
    Bucket, CredentialRecord, CredentialStats, HeuristicEstimator, RequestShape,
    RollingWindowCache, TokenEstimator, UsageWindow,
};
pub use store::CredentialStore;
pub use store::file::FileStore;
pub use store::sql::SqlStore;
