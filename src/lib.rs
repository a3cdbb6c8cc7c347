//! # elastistack
//!
//! Imports Go goroutine stack dumps into Elasticsearch as time-stamped
//! documents, so that questions like "what was every goroutine doing five
//! minutes before the crash" become index queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌──────────────┐
//! │   dump   │──▶│ timestamp  │──▶│ document │──▶│   pipeline   │──▶ _bulk
//! │  parser  │   │ inference  │   │ builder  │   │ N workers    │
//! └──────────┘   └────────────┘   └──────────┘   └──────┬───────┘
//!                                                       │ pending
//!                                                  ┌────▼─────┐
//!                                                  │ monitor  │
//!                                                  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`dump`] | Goroutine dump parser |
//! | [`timestamp`] | Capture instant and event time inference |
//! | [`document`] | Record → document conversion |
//! | [`pipeline`] | Bounded queue and delivery worker pool |
//! | [`monitor`] | Completion detection |
//! | [`backend`] | Backend trait and Elasticsearch bulk client |
//! | [`import`] | Import orchestration |
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`progress`] | Progress reporting on stderr |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |

pub mod backend;
pub mod config;
pub mod document;
pub mod dump;
pub mod error;
pub mod import;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod progress;
pub mod timestamp;
