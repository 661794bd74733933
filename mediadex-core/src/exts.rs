//! Single source of truth for recognized media extensions (scanner, proxy,
//! repair). All comparisons are against lowercased extensions without the dot.

use crate::model::AssetKind;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov"];

pub const RASTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];

/// Camera RAW plus DNG. Recognized by the scanner; the proxy stage decodes
/// them only as far as the `image` crate allows.
pub const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "crw", // Canon
    "nef", "nrw", // Nikon
    "arw", "sr2", "srf", // Sony
    "raf", // Fujifilm
    "orf", // Olympus
    "rw2", "raw", // Panasonic
    "rwl", // Leica
    "dng",
];

pub fn kind_for_extension(ext: &str) -> Option<AssetKind> {
    let ext = ext.to_ascii_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Video)
    } else if RASTER_EXTENSIONS.contains(&ext.as_str()) || RAW_EXTENSIONS.contains(&ext.as_str()) {
        Some(AssetKind::Image)
    } else {
        None
    }
}

pub fn kind_for_path(path: &std::path::Path) -> Option<AssetKind> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(kind_for_extension)
}

pub fn is_raw_extension(ext: &str) -> bool {
    RAW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_kinds() {
        assert_eq!(kind_for_extension("MOV"), Some(AssetKind::Video));
        assert_eq!(kind_for_extension("jpeg"), Some(AssetKind::Image));
        assert_eq!(kind_for_extension("NEF"), Some(AssetKind::Image));
        assert_eq!(kind_for_extension("txt"), None);
    }

    #[test]
    fn raw_and_raster_are_disjoint() {
        for e in RAW_EXTENSIONS {
            assert!(!RASTER_EXTENSIONS.contains(e), "{e} in both sets");
        }
        assert!(is_raw_extension("dng"));
        assert!(!is_raw_extension("tiff"));
    }

    #[test]
    fn kind_for_path_uses_extension() {
        use std::path::Path;
        assert_eq!(
            kind_for_path(Path::new("/mnt/nas/trip/clip.mkv")),
            Some(AssetKind::Video)
        );
        assert_eq!(kind_for_path(Path::new("README")), None);
    }
}
