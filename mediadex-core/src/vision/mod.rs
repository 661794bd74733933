//! Pluggable vision analyzers. The model itself is an external collaborator;
//! the core only depends on this trait and the (name, version) identity used
//! for claim targeting.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MediadexError, Result};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Description {
    pub description: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait VisionAnalyzer: Send + Sync + std::fmt::Debug {
    fn model_card(&self) -> ModelCard;

    /// Light pass: caption and tags for one frame on disk.
    async fn describe(&self, frame: &Path) -> Result<Description>;

    /// Full pass: text read out of the frame.
    async fn ocr(&self, frame: &Path) -> Result<String>;
}

/// Deterministic stand-in analyzer. Output depends only on the file name so
/// tests and dry runs are reproducible.
#[derive(Debug)]
pub struct MockAnalyzer;

#[async_trait]
impl VisionAnalyzer for MockAnalyzer {
    fn model_card(&self) -> ModelCard {
        ModelCard {
            name: "mock".into(),
            version: "1".into(),
        }
    }

    async fn describe(&self, frame: &Path) -> Result<Description> {
        let stem = frame
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("frame");
        Ok(Description {
            description: format!("mock description of {stem}"),
            tags: vec!["mock".into(), stem.to_string()],
        })
    }

    async fn ocr(&self, frame: &Path) -> Result<String> {
        let stem = frame
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("frame");
        Ok(format!("mock ocr of {stem}"))
    }
}

/// Analyzer registry, data-driven by name. Real backends register here; the
/// AIModel row is created from the returned card on first use.
pub fn create_analyzer(name: &str) -> Result<Box<dyn VisionAnalyzer>> {
    match name {
        "mock" => Ok(Box::new(MockAnalyzer)),
        other => Err(MediadexError::Config(format!(
            "unknown analyzer '{other}' (available: mock)"
        ))),
    }
}

/// Order-insensitive token overlap, the semantic-duplicate test applied to
/// consecutive scene descriptions. 1.0 when either token set contains the
/// other.
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .collect::<std::collections::BTreeSet<_>>()
    };
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    shared / ta.len().min(tb.len()) as f64
}

/// Threshold above which two descriptions are considered the same content.
pub const SEMANTIC_DUP_THRESHOLD: f64 = 0.85;
