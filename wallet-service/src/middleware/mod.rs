pub mod account;
pub mod metrics;

pub use account::AccountContext;
pub use metrics::metrics_middleware;
