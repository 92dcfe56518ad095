//! 错误类型
//!
//! 只有 `Config` 和 `StorageUnavailable` 会中止整个运行，
//! 其余错误都在单个文件 / 子目录 / 端点范围内记录并计数。

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StrmError {
    /// 配置文件不可读或无法解析
    #[error("配置错误: {0}")]
    Config(String),

    /// 端点登录或根目录列举失败
    #[error("连接 {endpoint} 失败: {message}")]
    Connectivity { endpoint: String, message: String },

    /// 单个目录列举失败
    #[error("列举目录 [{path}] 失败: {message}")]
    Enumeration { path: String, message: String },

    /// 记录数据库无法打开（被其他进程锁定、权限不足或文件损坏）
    #[error("记录数据库不可用 {path}: {message}")]
    StorageUnavailable { path: PathBuf, message: String },

    /// strm 文件已存在且不允许覆盖
    #[error("文件 {0} 已存在且不允许覆盖")]
    AlreadyExists(PathBuf),

    /// 下载的附属文件大小与远程不一致
    #[error("文件 {path} 大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// strm 文件内容无法解析
    #[error("无效的 strm 文件 {path}: {reason}")]
    InvalidPointer { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StrmError {
    /// 是否为需要中止整个运行的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrmError::Config(_) | StrmError::StorageUnavailable { .. }
        )
    }
}

pub type StrmResult<T> = std::result::Result<T, StrmError>;
