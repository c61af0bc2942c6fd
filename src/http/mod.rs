//! HTTP collaborators for vhost-routed services.
//!
//! # Data Flow
//! ```text
//! Service::serve_http
//!     → proxy.rs (forward to the first reachable backend)
//!     → response pipeline (log, error stats, page substitution)
//!     → error_pages.rs (cached bodies keyed by status code)
//! ```

pub mod error_pages;
pub mod proxy;

pub use error_pages::{ErrorPage, ErrorResponse};
pub use proxy::{HttpProxy, ProxyRequest};
