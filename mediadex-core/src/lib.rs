//! mediadex core: the distributed task-orchestration substrate and the
//! resumable video scene-segmentation engine behind the mediadex media
//! indexer.
//!
//! Workers are stateless OS processes that coordinate exclusively through
//! PostgreSQL row locks; there is no dispatcher and no peer-to-peer traffic.
//! Pipeline progression is expressed solely through asset status
//! transitions, claimed with `FOR UPDATE SKIP LOCKED` and protected by
//! time-bound leases that any worker may reclaim.

pub mod config;
pub mod db;
pub mod error;
pub mod exts;
pub mod logging;
pub mod maintenance;
pub mod model;
pub mod repository;
pub mod scanner;
pub mod stage;
pub mod storage;
pub mod video;
pub mod vision;
pub mod worker;

pub use config::Config;
pub use error::{MediadexError, Result};
