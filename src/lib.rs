//! skiff — a dynamically reconfigurable TCP/UDP reverse proxy and load
//! balancer.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────┐
//!                   │                   SKIFF                      │
//!   admin client    │  ┌─────────┐        ┌──────────────────┐     │
//!   ────────────────┼─▶│  admin  │───────▶│ ServiceRegistry  │     │
//!                   │  └─────────┘        │  svcs / vhosts   │     │
//!                   │                     └───────┬──────────┘     │
//!                   │                             │                │
//!   client conn     │  ┌─────────┐        ┌───────▼──────────┐     │
//!   ────────────────┼─▶│ service │───────▶│    balancer      │     │
//!   or datagram     │  │ tcp/udp │        │  RR (weighted)   │     │
//!                   │  └────┬────┘        │  LC              │     │
//!                   │       │             └───────┬──────────┘     │
//!                   │       ▼                     ▼                │
//!                   │  ┌─────────┐        ┌──────────────────┐     │
//!                   │  │ splice  │◀───────│     backend      │─────┼──▶ upstream
//!                   │  └─────────┘        │  health probes   │     │
//!                   │                     └──────────────────┘     │
//!                   └──────────────────────────────────────────────┘
//! ```
//!
//! A single process hosts any number of named services. Each binds a
//! listening socket and forwards client traffic to one of several backends
//! according to its balancing policy; HTTP services multiplex virtual hosts
//! and substitute custom error pages. The registry applies configuration
//! diffs at runtime without disturbing unchanged services.

// Core subsystems
pub mod backend;
pub mod config;
pub mod registry;
pub mod service;

// Data plane plumbing
pub mod http;
pub mod net;

// Control surface
pub mod admin;

pub use backend::Backend;
pub use config::{BackendConfig, Config, ServiceConfig, StateWriter};
pub use registry::{MultiError, RegistryError, ServiceRegistry, VirtualHost};
pub use service::Service;
