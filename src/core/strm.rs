//! strm 文件：内容只有一行播放地址

use crate::db::RecordStore;
use crate::error::{StrmError, StrmResult};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// strm 文件扩展名
pub const STRM_EXT: &str = "strm";

/// 一个 strm 文件的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrmEntry {
    /// 文件名（含 .strm 扩展名）
    pub name: String,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    /// 写入文件的播放地址
    pub raw_url: String,
}

impl StrmEntry {
    /// 由远程文件名生成，扩展名替换为 .strm
    pub fn from_remote(remote_name: &str, local_dir: &Path, remote_dir: &str, raw_url: String) -> Self {
        Self {
            name: format!("{}.{}", super::filter::stem(remote_name), STRM_EXT),
            local_dir: local_dir.to_path_buf(),
            remote_dir: remote_dir.to_string(),
            raw_url,
        }
    }

    /// 唯一键：播放地址的 SHA-1，与文件名和本地位置无关
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.raw_url)
    }

    pub fn path(&self) -> PathBuf {
        self.local_dir.join(&self.name)
    }

    /// 写入 strm 文件
    pub async fn create(&self, overwrite: bool) -> StrmResult<()> {
        fs::create_dir_all(&self.local_dir).await?;
        let path = self.path();
        if !overwrite && fs::try_exists(&path).await? {
            return Err(StrmError::AlreadyExists(path));
        }
        fs::write(&path, self.raw_url.as_bytes()).await?;
        debug!("已生成 {}", path.display());
        Ok(())
    }

    /// 删除 strm 文件及其数据库记录，文件不存在不算错误
    pub async fn delete(&self, store: &RecordStore) -> StrmResult<()> {
        let path = self.path();
        match fs::remove_file(&path).await {
            Ok(()) => debug!("已删除 {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        store.delete_fingerprint(&self.fingerprint()).await?;
        Ok(())
    }

    /// 用 HEAD 请求检查播放地址是否可用
    ///
    /// 重定向（3xx）或 200 且 Content-Type 为媒体类型时视为有效。
    /// `client` 不能自动跟随重定向，见 [`check_client`]。
    pub async fn validate(&self, client: &reqwest::Client) -> bool {
        let resp = match client.head(&self.raw_url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("检查 {} 失败: {}", self.raw_url, e);
                return false;
            }
        };

        let status = resp.status();
        if status.is_redirection() {
            return true;
        }
        if status != reqwest::StatusCode::OK {
            debug!("{} 返回状态 {}", self.raw_url, status);
            return false;
        }

        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(is_playable_content_type)
            .unwrap_or(false)
    }

    /// 读取已有的 strm 文件
    pub async fn read(path: &Path) -> StrmResult<Self> {
        let content = fs::read_to_string(path).await?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> StrmResult<Self> {
        let invalid = |reason: &str| StrmError::InvalidPointer {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let raw_url = content
            .split('\n')
            .next()
            .unwrap_or_default()
            .trim_end_matches('\r')
            .to_string();
        if raw_url.is_empty() {
            return Err(invalid("文件为空"));
        }

        let (_, remote_path) = raw_url
            .split_once("/d/")
            .ok_or_else(|| invalid("地址中没有 /d/ 段"))?;
        let remote_path = remote_path.split('?').next().unwrap_or_default();
        let mut segments: Vec<String> = remote_path
            .split('/')
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
            .collect();
        segments.pop();
        let remote_dir = format!("/{}", segments.join("/"));

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("文件名无效"))?
            .to_string();
        let local_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(Self {
            name,
            local_dir,
            remote_dir,
            raw_url,
        })
    }
}

/// 计算播放地址的指纹
pub fn fingerprint(raw_url: &str) -> String {
    let hash = Sha1::digest(raw_url.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_playable_content_type(value: &str) -> bool {
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    mime.starts_with("video/")
        || mime.starts_with("audio/")
        || mime == "application/octet-stream"
        || mime == "application/vnd.apple.mpegurl"
        || mime == "application/x-mpegurl"
}

/// 检查 strm 用的 HTTP 客户端，不跟随重定向
pub fn check_client(timeout_secs: u64, insecure_tls_verify: bool) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(insecure_tls_verify)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::serve_once;

    fn entry(name: &str, url: &str) -> StrmEntry {
        StrmEntry {
            name: name.to_string(),
            local_dir: PathBuf::from("/local"),
            remote_dir: "/Movies".to_string(),
            raw_url: url.to_string(),
        }
    }

    #[test]
    fn test_fingerprint_stable_and_name_independent() {
        let a = entry("A.strm", "http://host/d/Movies/A.mkv");
        let mut b = a.clone();
        b.name = "Renamed.strm".to_string();
        b.local_dir = PathBuf::from("/elsewhere");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 40);
        assert_ne!(
            a.fingerprint(),
            entry("A.strm", "http://host/d/Movies/B.mkv").fingerprint()
        );
        // SHA-1("hello world")
        assert_eq!(
            fingerprint("hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
    }

    #[test]
    fn test_from_remote_replaces_extension() {
        let e = StrmEntry::from_remote(
            "Show.S01E01.mkv",
            Path::new("/local/tv"),
            "/TV",
            "http://h/d/TV/Show.S01E01.mkv".to_string(),
        );
        assert_eq!(e.name, "Show.S01E01.strm");
        assert_eq!(e.path(), PathBuf::from("/local/tv/Show.S01E01.strm"));
    }

    #[tokio::test]
    async fn test_create_without_overwrite_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = entry("A.strm", "http://host/d/Movies/A.mkv");
        e.local_dir = dir.path().join("nested/dir");

        e.create(false).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(e.path()).unwrap(),
            "http://host/d/Movies/A.mkv"
        );

        let mut other = e.clone();
        other.raw_url = "http://host/d/Movies/Other.mkv".to_string();
        let err = other.create(false).await.unwrap_err();
        assert!(matches!(err, StrmError::AlreadyExists(_)));
        assert_eq!(
            std::fs::read_to_string(e.path()).unwrap(),
            "http://host/d/Movies/A.mkv"
        );

        other.create(true).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(e.path()).unwrap(),
            "http://host/d/Movies/Other.mkv"
        );
    }

    #[tokio::test]
    async fn test_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("B.strm");
        std::fs::write(&path, "http://host/d/Movies/%E7%94%B5%E5%BD%B1/B.mkv\r\nignored").unwrap();

        let e = StrmEntry::read(&path).await.unwrap();
        assert_eq!(e.raw_url, "http://host/d/Movies/%E7%94%B5%E5%BD%B1/B.mkv");
        assert_eq!(e.remote_dir, "/Movies/电影");
        assert_eq!(e.name, "B.strm");
        assert_eq!(e.local_dir, dir.path());
    }

    #[tokio::test]
    async fn test_read_rejects_foreign_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("C.strm");
        std::fs::write(&path, "http://host/stream/C.mkv").unwrap();

        let err = StrmEntry::read(&path).await.unwrap_err();
        assert!(matches!(err, StrmError::InvalidPointer { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(&dir.path().join("records.db")).await.unwrap();
        let mut e = entry("A.strm", "http://host/d/Movies/A.mkv");
        e.local_dir = dir.path().to_path_buf();

        e.create(false).await.unwrap();
        store.put_fingerprint(&e).await.unwrap();

        e.delete(&store).await.unwrap();
        assert!(!e.path().exists());
        assert!(store.get_fingerprint(&e.fingerprint()).await.unwrap().is_none());

        e.delete(&store).await.unwrap();
    }

    #[test]
    fn test_playable_content_types() {
        assert!(is_playable_content_type("video/mp4"));
        assert!(is_playable_content_type("application/octet-stream"));
        assert!(is_playable_content_type("Video/x-matroska; charset=binary"));
        assert!(!is_playable_content_type("text/html; charset=utf-8"));
        assert!(!is_playable_content_type("application/json"));
    }

    #[tokio::test]
    async fn test_validate() {
        let client = check_client(5, false).unwrap();

        let url = serve_once("HTTP/1.1 302 Found\r\nLocation: http://cdn/x\r\nContent-Length: 0\r\n\r\n").await;
        assert!(entry("A.strm", &url).validate(&client).await);

        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: 0\r\n\r\n").await;
        assert!(entry("A.strm", &url).validate(&client).await);

        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 0\r\n\r\n").await;
        assert!(!entry("A.strm", &url).validate(&client).await);

        let url = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        assert!(!entry("A.strm", &url).validate(&client).await);
    }

    #[tokio::test]
    async fn test_validate_with_insecure_client() {
        let client = check_client(5, true).unwrap();
        let url = serve_once("HTTP/1.1 302 Found\r\nLocation: http://cdn/x\r\nContent-Length: 0\r\n\r\n").await;
        assert!(entry("A.strm", &url).validate(&client).await);
    }

    #[tokio::test]
    async fn test_validate_transport_error() {
        let client = check_client(1, false).unwrap();
        assert!(!entry("A.strm", "http://127.0.0.1:1/d/A.mkv").validate(&client).await);
    }
}
