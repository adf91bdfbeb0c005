//! Compile-on-demand asset cache.
//!
//! A [`Protocol`] decides per source whether the cached artifact is still
//! fresh, compiles it through the compiler adapter when it is not, and
//! publishes the result atomically. [`AssetMiddleware`] drives it per HTTP
//! request, [`BatchCompiler`] per glob match.

pub mod batch;
pub mod confine;
pub mod error;
pub mod freshness;
pub mod inflight;
pub mod middleware;
pub mod observers;
pub mod protocol;
pub mod session;

pub use batch::{batch_handle, BatchCompiler, BatchConfig, BatchReport};
pub use confine::RootPolicy;
pub use error::ProtocolError;
pub use freshness::{Freshness, FreshnessFn, DEFAULT_HASH_DRIFT};
pub use inflight::InFlight;
pub use middleware::{
    default_error_response, default_not_found_response, status_response, AssetMiddleware,
    AssetRequest, ErrorResponder, MiddlewareConfig, NotFoundResponder,
};
pub use observers::{MetricsObserver, SessionObserver, SessionObservers, TracingReporter};
pub use protocol::{default_handle, default_swap_path, Protocol, ProtocolConfig};
pub use session::{Delivery, Outcome, Served, Session, SessionState};
