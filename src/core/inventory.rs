//! 本地已有 strm 文件的清点

use crate::core::strm::{StrmEntry, STRM_EXT};
use crate::error::StrmResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 递归查找目录下所有 .strm 文件，目录不存在时返回空列表
pub async fn find_strm_files(dir: &Path) -> StrmResult<Vec<PathBuf>> {
    if !tokio::fs::try_exists(dir).await? {
        debug!("本地目录 [{}] 不存在，跳过", dir.display());
        return Ok(Vec::new());
    }

    let dir = dir.to_path_buf();
    // 使用 spawn_blocking 避免阻塞 async runtime
    let files = tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case(STRM_EXT))
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect::<Vec<_>>()
    })
    .await
    .map_err(std::io::Error::other)?;

    Ok(files)
}

/// 读取目录下的所有 strm 文件，按指纹索引，无法解析的文件记录后跳过
pub async fn scan_local(dir: &Path) -> StrmResult<HashMap<String, StrmEntry>> {
    let mut entries = HashMap::new();
    for path in find_strm_files(dir).await? {
        match StrmEntry::read(&path).await {
            Ok(entry) => {
                entries.insert(entry.fingerprint(), entry);
            }
            Err(e) => warn!("跳过本地文件: {}", e),
        }
    }
    debug!("本地目录 [{}] 中有 {} 个 strm", dir.display(), entries.len());
    Ok(entries)
}

/// 远程目录是否在某个根目录之下（含根目录本身）
pub fn under_roots(remote_dir: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| {
        let root = root.trim_end_matches('/');
        root.is_empty() || remote_dir == root || remote_dir.starts_with(&format!("{root}/"))
    })
}
