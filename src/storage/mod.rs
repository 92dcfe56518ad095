pub mod alist;
#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use alist::AlistClient;

/// 列举单个目录时返回的条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// 直接下载地址
    pub raw_url: String,
}

/// 远程目录列举接口
#[async_trait]
pub trait RemoteLister: Send + Sync {
    /// 列出 `path` 下的直接子项，`force_refresh` 要求服务端跳过缓存
    async fn list(&self, path: &str, force_refresh: bool) -> Result<Vec<RemoteEntry>>;

    /// 服务器地址，用于拼接 strm 中的播放地址
    fn base_url(&self) -> &str;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据端点配置登录并创建列举客户端
pub async fn connect(
    endpoint: &crate::config::Endpoint,
    timeout_secs: u64,
) -> Result<Arc<dyn RemoteLister>> {
    let client = AlistClient::login(endpoint, timeout_secs).await?;
    Ok(Arc::new(client) as Arc<dyn RemoteLister>)
}
