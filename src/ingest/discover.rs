//! Enumeration of selectable sources.

use std::fs;
use std::path::Path;

use super::SourceConfig;

/// File extensions offered as video sources.
pub const MEDIA_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "mkv", "webm"];

/// Camera device nodes present on this host (`/dev/video*`), sorted.
pub fn list_devices() -> Vec<SourceConfig> {
    list_devices_in(Path::new("/dev"))
}

pub(crate) fn list_devices_in(dir: &Path) -> Vec<SourceConfig> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut indexes: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            name.to_str()?.strip_prefix("video")?.parse::<u32>().ok()
        })
        .collect();
    indexes.sort_unstable();
    indexes
        .into_iter()
        .map(|index| SourceConfig::Device {
            device: dir.join(format!("video{index}")).display().to_string(),
        })
        .collect()
}

/// Video files directly inside `dir`, sorted by path. A missing directory
/// yields an empty list.
pub fn list_media_files(dir: &Path) -> Vec<SourceConfig> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_media_extension(path))
        .map(|path| path.display().to_string())
        .collect();
    files.sort();
    files.into_iter().map(SourceConfig::file).collect()
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            MEDIA_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_only_video_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.MP4", "a.webm", "notes.txt", "clip.mkv.part"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let names: Vec<String> = list_media_files(dir.path())
            .iter()
            .map(|s| {
                Path::new(s.identifier())
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["a.webm", "b.MP4"]);
    }

    #[test]
    fn lists_device_nodes_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["video10", "video2", "videoX", "vbi0"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let devices: Vec<String> = list_devices_in(dir.path())
            .iter()
            .map(|s| s.identifier().to_string())
            .collect();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].ends_with("video2"));
        assert!(devices[1].ends_with("video10"));
    }

    #[test]
    fn missing_directory_is_empty() {
        assert!(list_media_files(Path::new("/nonexistent/helmet-media")).is_empty());
    }
}
