use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// 外部字幕文件查找
pub struct ExternalSubtitleFinder;

impl ExternalSubtitleFinder {
    /// 查找与媒体文件同目录、文件名相似的字幕文件
    ///
    /// 规则：字幕文件名（去掉扩展名、'_' 换成空格）不区分大小写地包含媒体文件名（同样处理）。
    /// 只处理本地文件；找不到或目录不可读时返回空列表。结果是按文件名排序的 file:// URL。
    pub fn find_subtitle_files(media_url: &str, extensions: &[String]) -> Vec<String> {
        let Some(media_path) = Self::local_path(media_url) else {
            return Vec::new();
        };
        let (Some(directory), Some(media_name)) = (media_path.parent(), Self::normalized_stem(&media_path)) else {
            return Vec::new();
        };
        if media_name.is_empty() {
            return Vec::new();
        }

        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("无法读取字幕目录 {}: {}", directory.display(), e);
                return Vec::new();
            }
        };

        let mut found: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| path != &media_path)
            .filter(|path| Self::has_subtitle_extension(path, extensions))
            .filter(|path| {
                Self::normalized_stem(path)
                    .map(|name| name.contains(&media_name))
                    .unwrap_or(false)
            })
            .collect();
        found.sort();

        for path in &found {
            info!("📝 找到外部字幕文件: {}", path.display());
        }
        found
            .into_iter()
            .map(|path| format!("{}{}", FILE_SCHEME, path.display()))
            .collect()
    }

    /// file:// URL 或无协议前缀的路径视为本地文件
    fn local_path(url: &str) -> Option<PathBuf> {
        if let Some(path) = url.strip_prefix(FILE_SCHEME) {
            Some(PathBuf::from(path))
        } else if url.contains("://") {
            None
        } else {
            Some(PathBuf::from(url))
        }
    }

    fn normalized_stem(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_string_lossy();
        Some(stem.replace('_', " ").to_lowercase())
    }

    fn has_subtitle_extension(path: &Path, extensions: &[String]) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false)
    }
}
