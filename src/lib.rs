//! Payment routing across unreliable providers: background health probing,
//! health-aware provider selection, and a retry loop driven by prioritised
//! recovery strategies.

pub mod app;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod services;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod utils;

pub use app::config::Config;
pub use app::state::AppState;
