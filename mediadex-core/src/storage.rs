//! Cache-directory layout. Every path stored in the database is relative to
//! `data_dir`; builders here return both forms so repositories never see an
//! absolute path.

use std::path::{Path, PathBuf};

use uuid::Uuid;

const SHARDS: i64 = 1000;

#[derive(Clone, Debug)]
pub struct StorageLayout {
    data_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn shard(asset_id: i64) -> i64 {
        asset_id % SHARDS
    }

    pub fn thumbnail_rel(library_slug: &str, asset_id: i64) -> String {
        format!(
            "{library_slug}/thumbnails/{}/{asset_id}.jpg",
            Self::shard(asset_id)
        )
    }

    pub fn proxy_rel(library_slug: &str, asset_id: i64) -> String {
        format!(
            "{library_slug}/proxies/{}/{asset_id}.webp",
            Self::shard(asset_id)
        )
    }

    pub fn head_clip_rel(library_slug: &str, asset_id: i64) -> String {
        format!("video_clips/{library_slug}/{asset_id}/head_clip.mp4")
    }

    /// Scene rep frames encode the scene bounds in the filename, rounded to
    /// milliseconds so the name is stable across resumes.
    pub fn scene_frame_rel(library_slug: &str, asset_id: i64, start_ts: f64, end_ts: f64) -> String {
        format!("video_scenes/{library_slug}/{asset_id}/{start_ts:.3}_{end_ts:.3}.jpg")
    }

    pub fn thumbnail_path(&self, library_slug: &str, asset_id: i64) -> PathBuf {
        self.data_dir.join(Self::thumbnail_rel(library_slug, asset_id))
    }

    pub fn proxy_path(&self, library_slug: &str, asset_id: i64) -> PathBuf {
        self.data_dir.join(Self::proxy_rel(library_slug, asset_id))
    }

    pub fn head_clip_path(&self, library_slug: &str, asset_id: i64) -> PathBuf {
        self.data_dir.join(Self::head_clip_rel(library_slug, asset_id))
    }

    pub fn scene_frame_path(
        &self,
        library_slug: &str,
        asset_id: i64,
        start_ts: f64,
        end_ts: f64,
    ) -> PathBuf {
        self.data_dir
            .join(Self::scene_frame_rel(library_slug, asset_id, start_ts, end_ts))
    }

    /// Lazy on-demand clip for a search hit at an integral timestamp.
    pub fn search_clip_rel(library_slug: &str, asset_id: i64, ts: f64) -> String {
        format!("video_clips/{library_slug}/{asset_id}/clip_{}.mp4", ts as i64)
    }

    pub fn tmp_dir(&self, library_slug: &str) -> PathBuf {
        self.data_dir.join("tmp").join(library_slug)
    }

    /// Fresh ephemeral transcode target under the per-library tmp dir.
    pub fn new_tmp_transcode(&self, library_slug: &str) -> PathBuf {
        self.tmp_dir(library_slug)
            .join(format!("{}.mp4", Uuid::new_v4()))
    }

    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.data_dir.join(rel)
    }
}
