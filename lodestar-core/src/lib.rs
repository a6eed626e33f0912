//! # Lodestar Core
//!
//! The research session manager behind the Lodestar MCP server.
//!
//! ```text
//! ResearchService
//!   |-- SessionRegistry   (research id -> ResearchUnit)
//!   |-- TopicCache        (topic       -> CacheEntry)
//!   +-- dyn ResearchEngine (conduct / quick search / write report)
//!          \-- ProgressSender -> ProgressReceiver (relay)
//! ```
//!
//! Nothing in this crate knows about JSON-RPC; the protocol surface lives in
//! `lodestar-mcp`.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod progress;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod types;

pub use cache::{CacheEntry, TopicCache};
pub use config::{load_config, EngineKind, LodestarConfig, TransportKind};
pub use engine::{ResearchEngine, StaticEngine};
pub use error::{ConfigError, EngineError, RegistryError, ServiceError};
pub use progress::{progress_channel, Progress, ProgressReceiver, ProgressSender};
pub use registry::SessionRegistry;
pub use service::ResearchService;
pub use types::{Findings, Report, ResearchMode, ResearchUnit, SearchResult, Source, UnitState};
