//! 附属文件下载（字幕、海报等 alt-exts 文件）

use crate::error::{StrmError, StrmResult};
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 部分服务器会拒绝没有浏览器 UA 的下载请求
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 下载结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// 已下载，附带写入的字节数
    Downloaded(u64),
    /// 本地已存在同名文件，跳过
    Exists,
}

/// 附属文件下载器
#[derive(Clone)]
pub struct AssetDownloader {
    client: reqwest::Client,
}

impl AssetDownloader {
    pub fn new(timeout_secs: u64, insecure_tls_verify: bool) -> StrmResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(insecure_tls_verify)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    /// 下载到 `dest`，写入后校验大小
    ///
    /// 先写入 `.part` 临时文件，大小一致后才重命名为目标文件，
    /// 任何失败都会删除临时文件。
    pub async fn download(&self, url: &str, dest: &Path, expected_size: u64) -> StrmResult<DownloadOutcome> {
        if fs::try_exists(dest).await? {
            debug!("文件 [{}] 已存在，跳过下载", dest.display());
            return Ok(DownloadOutcome::Exists);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut part_name = dest.file_name().unwrap_or_default().to_os_string();
        part_name.push(".part");
        let part_path = dest.with_file_name(part_name);

        let cleanup = scopeguard::guard(part_path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });

        let resp = self.client.get(url).send().await?.error_for_status()?;
        let mut file = fs::File::create(&part_path).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if written != expected_size {
            return Err(StrmError::SizeMismatch {
                path: dest.to_path_buf(),
                expected: expected_size,
                actual: written,
            });
        }

        fs::rename(&part_path, dest).await?;
        scopeguard::ScopeGuard::into_inner(cleanup);

        debug!("已下载 [{}] 到 [{}], {} 字节", url, dest.display(), written);
        Ok(DownloadOutcome::Downloaded(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::serve_once;

    const BODY_RESPONSE: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn test_download_verifies_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("poster.jpg");
        let downloader = AssetDownloader::new(5, false).unwrap();

        let url = serve_once(BODY_RESPONSE).await;
        let outcome = downloader.download(&url, &dest, 5).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Downloaded(5));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");

        // 已存在时不会发起请求
        let outcome = downloader
            .download("http://127.0.0.1:1/unused", &dest, 5)
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Exists);
    }

    #[tokio::test]
    async fn test_size_mismatch_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fanart.jpg");
        let downloader = AssetDownloader::new(5, false).unwrap();

        let url = serve_once(BODY_RESPONSE).await;
        let err = downloader.download(&url, &dest, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            StrmError::SizeMismatch {
                expected: 1024,
                actual: 5,
                ..
            }
        ));
        assert!(!dest.exists());
        assert!(!dir.path().join("fanart.jpg.part").exists());
    }
}
