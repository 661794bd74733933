//! Coarse-grained database access. Workers and the CLI go through these
//! modules only; no SQL outside this tree and the migrations.

pub mod asset;
pub mod library;
pub mod scene;
pub mod system;
pub mod worker;
