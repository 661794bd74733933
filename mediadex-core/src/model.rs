use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::MediadexError;

macro_rules! db_str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = MediadexError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(&s).ok_or_else(|| {
                    MediadexError::Internal(format!(
                        concat!("invalid ", stringify!($name), " value: {}"),
                        s
                    ))
                })
            }
        }
    };
}

db_str_enum!(AssetStatus {
    Pending => "pending",
    Processing => "processing",
    Proxied => "proxied",
    AnalyzedLight => "analyzed_light",
    Completed => "completed",
    Failed => "failed",
    Poisoned => "poisoned",
});

impl AssetStatus {
    /// Terminal states are never claimed again without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssetStatus::Completed | AssetStatus::Poisoned)
    }
}

db_str_enum!(AssetKind {
    Image => "image",
    Video => "video",
});

db_str_enum!(ScanStatus {
    Idle => "idle",
    ScanRequested => "scan_requested",
    Scanning => "scanning",
});

db_str_enum!(WorkerState {
    Idle => "idle",
    Processing => "processing",
    Paused => "paused",
    Offline => "offline",
});

db_str_enum!(WorkerCommand {
    None => "none",
    Pause => "pause",
    Resume => "resume",
    Shutdown => "shutdown",
    ForensicDump => "forensic_dump",
});

db_str_enum!(SceneCloseReason {
    Phash => "phash",
    Temporal => "temporal",
    Forced => "forced",
});

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Library {
    pub slug: String,
    pub name: String,
    pub absolute_path: String,
    pub is_active: bool,
    #[sqlx(try_from = "String")]
    pub scan_status: ScanStatus,
    pub target_model_id: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub library_id: String,
    pub rel_path: String,
    #[sqlx(try_from = "String")]
    pub kind: AssetKind,
    pub mtime: f64,
    pub size: i64,
    #[sqlx(try_from = "String")]
    pub status: AssetStatus,
    pub claimed_from: Option<String>,
    pub tags_model_id: Option<i64>,
    pub analysis_model_id: Option<i64>,
    pub visual_analysis: Option<Value>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub video_preview_path: Option<String>,
    pub segmentation_version: Option<i64>,
}

/// A claimed asset joined with the library columns the stage needs to reach
/// the source file.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ClaimedAsset {
    pub id: i64,
    pub library_id: String,
    pub rel_path: String,
    #[sqlx(try_from = "String")]
    pub kind: AssetKind,
    pub retry_count: i32,
    pub tags_model_id: Option<i64>,
    pub analysis_model_id: Option<i64>,
    pub segmentation_version: Option<i64>,
    pub claimed_from: Option<String>,
    pub library_root: String,
}

impl ClaimedAsset {
    pub fn source_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.library_root).join(&self.rel_path)
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct VideoScene {
    pub id: i64,
    pub asset_id: i64,
    pub start_ts: f64,
    pub end_ts: f64,
    pub rep_frame_path: String,
    pub sharpness: f64,
    #[sqlx(try_from = "String")]
    pub close_reason: SceneCloseReason,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct VideoActiveState {
    pub asset_id: i64,
    pub anchor_phash: String,
    pub scene_start_ts: f64,
    pub best_pts: f64,
    pub best_sharpness: f64,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct WorkerRow {
    pub worker_id: String,
    pub hostname: String,
    pub last_seen_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub state: WorkerState,
    #[sqlx(try_from = "String")]
    pub command: WorkerCommand,
    pub stats: Option<Value>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct AiModel {
    pub id: i64,
    pub name: String,
    pub version: String,
}
