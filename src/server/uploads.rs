//! アップロード画像の保存先

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

const FALLBACK_NAME: &str = "upload";

#[derive(Debug, Clone)]
pub struct UploadStore {
    directory: PathBuf,
}

impl UploadStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// 保存先ディレクトリを作成する
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.directory)
            .with_context(|| format!("Failed to create uploads directory: {}", self.directory.display()))
    }

    /// アップロードを `{YYYYmmddHHMMSS}_{元のファイル名}` として保存し、保存名を返す
    pub async fn persist(&self, original_name: &str, bytes: &[u8]) -> Result<String> {
        let name = stored_name(original_name, Local::now());
        let path = self.directory.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to store upload: {}", path.display()))?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "アップロードを保存しました");
        Ok(name)
    }

    /// 保存名からパスを得る（パス区切りを含む名前は拒否）
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return None;
        }
        Some(self.directory.join(name))
    }
}

/// 元のファイル名の最後の要素だけを残す
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        FALLBACK_NAME.to_string()
    } else {
        base.to_string()
    }
}

pub fn stored_name(original: &str, now: DateTime<Local>) -> String {
    format!("{}_{}", now.format("%Y%m%d%H%M%S"), sanitize_file_name(original))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
    }

    #[test]
    fn test_stored_name_format() {
        assert_eq!(stored_name("chest.png", fixed_time()), "20240309070501_chest.png");
    }

    #[test]
    fn test_path_components_are_stripped() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\scans\\x ray.jpg"), "x ray.jpg");
        assert_eq!(sanitize_file_name(""), "upload");
        assert_eq!(sanitize_file_name("dir/"), "upload");
        assert_eq!(sanitize_file_name(".."), "upload");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = UploadStore::new("static/uploads");
        assert_eq!(store.resolve("a.png"), Some(PathBuf::from("static/uploads/a.png")));
        assert_eq!(store.resolve("../config.json"), None);
        assert_eq!(store.resolve(".."), None);
        assert_eq!(store.resolve(""), None);
    }

    #[tokio::test]
    async fn test_persist_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("uploads"));
        store.ensure().unwrap();

        let name = store.persist("scan.png", b"bytes").await.unwrap();
        assert!(name.ends_with("_scan.png"));
        assert_eq!(name.len(), "YYYYmmddHHMMSS_scan.png".len());
        assert_eq!(std::fs::read(store.directory().join(&name)).unwrap(), b"bytes");
    }
}
