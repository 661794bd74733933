//! Vision analysis stages. Light writes description + tags; full only ever
//! adds OCR text. Every write re-reads the row first and checks model
//! identity (the strict merge policy).

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{MediadexError, Result};
use crate::model::{AssetKind, AssetStatus, ClaimedAsset};
use crate::repository::asset as asset_repo;
use crate::repository::asset::ClaimFilter;
use crate::repository::scene as scene_repo;
use crate::repository::system as system_repo;
use crate::storage::StorageLayout;
use crate::vision::{token_set_similarity, VisionAnalyzer, SEMANTIC_DUP_THRESHOLD};
use crate::worker::{WorkerContext, WorkerStage};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnalysisMode {
    Light,
    Full,
}

impl AnalysisMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Self::Light),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    /// Statuses this pass claims: its pipeline entry point plus `failed`,
    /// so an asset this stage failed is re-picked here and not left to
    /// another stage's queue.
    fn claim_statuses(&self) -> [AssetStatus; 2] {
        match self {
            Self::Light => [AssetStatus::Proxied, AssetStatus::Failed],
            Self::Full => [AssetStatus::AnalyzedLight, AssetStatus::Failed],
        }
    }

    fn success_status(&self) -> AssetStatus {
        match self {
            Self::Light => AssetStatus::AnalyzedLight,
            Self::Full => AssetStatus::Completed,
        }
    }
}

struct AiShared {
    library: Option<String>,
    mode: AnalysisMode,
    repair: bool,
    verbose: bool,
    analyzer: Box<dyn VisionAnalyzer>,
    model_id: Option<i64>,
    system_default: Option<i64>,
}

impl AiShared {
    fn new(
        library: Option<String>,
        mode: AnalysisMode,
        repair: bool,
        verbose: bool,
        analyzer: Box<dyn VisionAnalyzer>,
    ) -> Self {
        Self {
            library,
            mode,
            repair,
            verbose,
            analyzer,
            model_id: None,
            system_default: None,
        }
    }

    async fn prepare(&mut self, ctx: &WorkerContext, kind: AssetKind) -> Result<()> {
        let card = self.analyzer.model_card();
        if card.name == "mock" && !ctx.config.allow_mock_default {
            info!("mock analyzer active; not eligible as system default");
        }
        let model_id = system_repo::get_or_create_model(&ctx.pool, &card).await?;
        self.model_id = Some(model_id);
        self.system_default = system_repo::default_model_id(&ctx.pool).await?;
        if self.repair {
            match self.system_default {
                Some(default) => {
                    let reset = asset_repo::reset_for_reanalysis(
                        &ctx.pool,
                        kind,
                        self.library.as_deref(),
                        default,
                    )
                    .await?;
                    if reset > 0 || self.verbose {
                        info!(reset, "ai repair reset assets for re-analysis");
                    }
                }
                None => warn!("--repair requested but no system default model is set; skipping"),
            }
        }
        Ok(())
    }

    fn model_id(&self) -> Result<i64> {
        self.model_id
            .ok_or_else(|| MediadexError::Internal("ai stage used before prepare".into()))
    }

    fn claim_filter(&self, kind: AssetKind) -> ClaimFilter {
        ClaimFilter {
            library: self.library.clone(),
            // The effective-model predicate only engages once a fleet-wide
            // default exists; without one there is nothing to resolve
            // against and any worker may take the asset.
            worker_model_id: self.system_default.and(self.model_id),
            system_default_model_id: self.system_default,
            require_scenes: kind == AssetKind::Video,
            ..ClaimFilter::new(kind, &self.mode.claim_statuses())
        }
    }
}

fn vision_object(metadata: Option<&Value>) -> Map<String, Value> {
    metadata
        .and_then(|m| m.get("vision"))
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default()
}

/// Image analysis: the asset-level counterpart of the per-scene merge.
pub struct AiImageStage {
    shared: AiShared,
}

impl AiImageStage {
    pub fn new(
        library: Option<String>,
        mode: AnalysisMode,
        repair: bool,
        verbose: bool,
        analyzer: Box<dyn VisionAnalyzer>,
    ) -> Self {
        Self {
            shared: AiShared::new(library, mode, repair, verbose, analyzer),
        }
    }

    /// The claim predicate this stage runs with.
    pub fn claim_filter(&self) -> ClaimFilter {
        self.shared.claim_filter(AssetKind::Image)
    }

    async fn analyze(&self, ctx: &WorkerContext, asset: &ClaimedAsset) -> Result<()> {
        let model_id = self.shared.model_id()?;
        let layout = StorageLayout::new(&ctx.config.data_dir);
        let proxy = layout.proxy_path(&asset.library_id, asset.id);
        if !proxy.is_file() {
            return Err(MediadexError::Transient(format!(
                "proxy missing on disk: {}",
                proxy.display()
            )));
        }

        // Re-read just before writing; the claim row may be stale.
        let current = asset_repo::get(&ctx.pool, asset.id)
            .await?
            .ok_or_else(|| MediadexError::NotFound(format!("asset {} vanished", asset.id)))?;
        let mut vision = vision_object(current.visual_analysis.as_ref());

        let needs_light = self.shared.mode == AnalysisMode::Light
            || current.tags_model_id != Some(model_id)
            || !vision.contains_key("description");
        if needs_light {
            let described = self.shared.analyzer.describe(&proxy).await?;
            vision.insert("description".into(), json!(described.description));
            vision.insert("tags".into(), json!(described.tags));
            asset_repo::set_tags_model(&ctx.pool, asset.id, model_id).await?;
        }
        if self.shared.mode == AnalysisMode::Full {
            // Full only adds ocr_text; description and tags are never
            // overwritten by this pass.
            let text = self.shared.analyzer.ocr(&proxy).await?;
            vision.insert("ocr_text".into(), json!(text));
            asset_repo::set_analysis_model(&ctx.pool, asset.id, model_id).await?;
        }
        asset_repo::set_visual_analysis(&ctx.pool, asset.id, &Value::Object(
            Map::from_iter([("vision".to_string(), Value::Object(vision))]),
        ))
        .await?;
        asset_repo::mark_succeeded(&ctx.pool, asset.id, self.shared.mode.success_status()).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerStage for AiImageStage {
    fn role(&self) -> &'static str {
        "ai-image"
    }

    async fn before_loop(&mut self, ctx: &WorkerContext) -> Result<()> {
        self.shared.prepare(ctx, AssetKind::Image).await
    }

    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool> {
        let filter = self.claim_filter();
        let Some(asset) =
            asset_repo::claim(&ctx.pool, &ctx.worker_id, &filter, ctx.lease_ttl_secs()).await?
        else {
            return Ok(false);
        };
        if ctx.should_stop() {
            asset_repo::release_claim(&ctx.pool, asset.id).await?;
            return Ok(false);
        }
        match self.analyze(ctx, &asset).await {
            Ok(()) => {
                if self.shared.verbose {
                    info!(asset_id = asset.id, rel_path = %asset.rel_path, "image analyzed");
                }
            }
            Err(e) => {
                warn!(asset_id = asset.id, "image analysis failed: {e}");
                asset_repo::mark_failed(&ctx.pool, asset.id, asset.retry_count, &e.to_string(), false)
                    .await?;
            }
        }
        Ok(true)
    }
}

/// Per-scene vision backfill for videos.
pub struct AiVideoStage {
    shared: AiShared,
}

impl AiVideoStage {
    pub fn new(
        library: Option<String>,
        mode: AnalysisMode,
        repair: bool,
        verbose: bool,
        analyzer: Box<dyn VisionAnalyzer>,
    ) -> Self {
        Self {
            shared: AiShared::new(library, mode, repair, verbose, analyzer),
        }
    }

    /// The claim predicate this stage runs with.
    pub fn claim_filter(&self) -> ClaimFilter {
        self.shared.claim_filter(AssetKind::Video)
    }

    async fn analyze_scenes(&self, ctx: &WorkerContext, asset: &ClaimedAsset) -> Result<bool> {
        let model_id = self.shared.model_id()?;
        let layout = StorageLayout::new(&ctx.config.data_dir);
        let scenes = scene_repo::list(&ctx.pool, asset.id).await?;
        // A stored model different from ours means the light pass must be
        // redone for every scene, not merged into.
        let rerun_light = asset.tags_model_id != Some(model_id);
        let mut previous_description: Option<String> = None;

        for scene_ref in &scenes {
            if ctx.should_stop() {
                asset_repo::release_claim(&ctx.pool, asset.id).await?;
                return Ok(false);
            }
            // Strict merge: work from the row as it is now, not from the
            // list snapshot.
            let Some(scene) = scene_repo::get(&ctx.pool, scene_ref.id).await? else {
                continue;
            };
            let frame = layout.resolve(&scene.rep_frame_path);
            if !frame.is_file() {
                warn!(
                    scene_id = scene.id,
                    frame = %frame.display(),
                    "rep frame missing; leaving scene for repair"
                );
                previous_description = scene.description.clone();
                continue;
            }

            let mut vision = vision_object(scene.metadata.as_ref());
            let mut description = scene.description.clone();
            let mut semantic_duplicate = scene
                .metadata
                .as_ref()
                .and_then(|m| m.get("semantic_duplicate"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            if scene.description.is_none() || rerun_light {
                let described = self.shared.analyzer.describe(&frame).await?;
                if let Some(prev) = &previous_description {
                    semantic_duplicate = token_set_similarity(prev, &described.description)
                        > SEMANTIC_DUP_THRESHOLD;
                }
                vision.insert("description".into(), json!(described.description));
                vision.insert("tags".into(), json!(described.tags));
                description = Some(described.description);
            }
            if self.shared.mode == AnalysisMode::Full && !vision.contains_key("ocr_text") {
                let text = self.shared.analyzer.ocr(&frame).await?;
                vision.insert("ocr_text".into(), json!(text));
            }

            let mut metadata = Map::new();
            metadata.insert("vision".into(), Value::Object(vision));
            if semantic_duplicate {
                metadata.insert("semantic_duplicate".into(), json!(true));
            }
            scene_repo::update_scene_vision(
                &ctx.pool,
                scene.id,
                description.as_deref(),
                &Value::Object(metadata),
            )
            .await?;
            previous_description = description;
            // Scene-rate lease renewal, same cadence as segmentation.
            asset_repo::renew_lease(&ctx.pool, asset.id, ctx.lease_ttl_secs()).await?;
        }

        // Completeness check before any forward transition.
        let missing = scene_repo::scenes_missing_description(&ctx.pool, asset.id).await?;
        if !missing.is_empty() {
            return Err(MediadexError::Transient(format!(
                "{} scene(s) still missing descriptions (rep frames absent?)",
                missing.len()
            )));
        }
        asset_repo::set_tags_model(&ctx.pool, asset.id, model_id).await?;
        if self.shared.mode == AnalysisMode::Full {
            let missing_ocr = scene_repo::scenes_missing_ocr(&ctx.pool, asset.id).await?;
            if !missing_ocr.is_empty() {
                return Err(MediadexError::Transient(format!(
                    "{} scene(s) still missing ocr_text",
                    missing_ocr.len()
                )));
            }
            asset_repo::set_analysis_model(&ctx.pool, asset.id, model_id).await?;
        }
        asset_repo::mark_succeeded(&ctx.pool, asset.id, self.shared.mode.success_status()).await?;
        Ok(true)
    }
}

#[async_trait]
impl WorkerStage for AiVideoStage {
    fn role(&self) -> &'static str {
        "ai-video"
    }

    async fn before_loop(&mut self, ctx: &WorkerContext) -> Result<()> {
        self.shared.prepare(ctx, AssetKind::Video).await
    }

    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool> {
        let filter = self.claim_filter();
        let Some(asset) =
            asset_repo::claim(&ctx.pool, &ctx.worker_id, &filter, ctx.lease_ttl_secs()).await?
        else {
            return Ok(false);
        };
        match self.analyze_scenes(ctx, &asset).await {
            Ok(worked) => {
                if worked && self.shared.verbose {
                    info!(asset_id = asset.id, rel_path = %asset.rel_path, "video scenes analyzed");
                }
                Ok(worked)
            }
            Err(e) => {
                warn!(asset_id = asset.id, "video analysis failed: {e}");
                asset_repo::mark_failed(&ctx.pool, asset.id, asset.retry_count, &e.to_string(), false)
                    .await?;
                Ok(true)
            }
        }
    }
}
