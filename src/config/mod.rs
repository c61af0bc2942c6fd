//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! JSON config / state file
//!     → loader.rs (parse & apply through the registry)
//!     → schema.rs (value objects, defaults, merge and equality)
//!
//! On registry change:
//!     state.rs serializes the authoritative config back to disk
//! ```

pub mod loader;
pub mod schema;
pub mod state;

pub use schema::{filter_empty, BackendConfig, Config, ServiceConfig};
pub use schema::{
    DEFAULT_BALANCE, DEFAULT_CHECK_INTERVAL, DEFAULT_FALL, DEFAULT_NET, DEFAULT_RISE,
    DEFAULT_TIMEOUT, DEFAULT_WEIGHT, LEAST_CONN, ROUND_ROBIN,
};
pub use state::StateWriter;
