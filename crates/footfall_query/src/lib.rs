//! Read-only analytics API over the DuckDB store.
//!
//! Stats endpoints aggregate `v_traffic_normalized` over a working-day
//! window and cache their results until the TTL lapses or the ETL calls
//! the admin clear-cache hook.

pub mod cache;
mod error;
pub mod params;
pub mod router;
pub mod service;
pub mod sql;

pub use cache::{CacheKey, QueryCache};
pub use error::{ApiError, ApiResult};
pub use params::{Period, StatsFilter, WorkingHours};
pub use router::{router, serve, AppState, CLEAR_CACHE_PATH, TOKEN_HEADER};
pub use service::{Details, ErrorLog, Metrics, Point, QueryService, Store};
