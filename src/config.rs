//! 应用配置模块

use crate::error::{StrmError, StrmResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// 记录数据库路径，为空时使用数据目录下的默认位置
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// 日志文件路径，为空时只输出到控制台
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// 日志文件最大大小（MB）
    #[serde(default = "default_log_max_size_mb")]
    pub log_max_size_mb: u32,
    #[serde(default)]
    pub colored_log: bool,
    /// 请求超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// 生成 strm 的扩展名
    #[serde(default)]
    pub exts: Vec<String>,
    /// 直接下载到本地的附属文件扩展名（字幕、海报等）
    #[serde(default)]
    pub alt_exts: Vec<String>,
    #[serde(default)]
    pub create_sub_directory: bool,
}

/// 远程端点
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, alias = "inscure-tls-verify")]
    pub insecure_tls_verify: bool,
    #[serde(default)]
    pub dirs: Vec<DirBinding>,
    /// 同时进行的目录列举数量
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 端点级扩展名，非空时覆盖全局 exts
    #[serde(default)]
    pub exts: Vec<String>,
}

/// 本地目录与远程目录的绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirBinding {
    pub local_directory: PathBuf,
    #[serde(default)]
    pub remote_directories: Vec<String>,
    #[serde(default)]
    pub not_recursive: bool,
    #[serde(default)]
    pub create_sub_directory: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub force_refresh: bool,
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_log_max_size_mb() -> u32 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    5
}

/// exts 为空时使用的默认视频扩展名
const DEFAULT_EXTS: &[&str] = &[".mp4", ".mkv", ".avi", ".ts", ".rmvb", ".mov", ".flv", ".wmv"];

impl Config {
    /// 从配置文件加载，`.json` 按 JSON 解析，其余按 YAML 解析
    pub fn load(path: &Path) -> StrmResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StrmError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
        .map_err(|e| StrmError::Config(format!("{}: {}", path.display(), e)))?;

        debug!("已加载配置文件: {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> StrmResult<Self> {
        let mut config: Config = serde_json::from_str(content)
            .map_err(|e| StrmError::Config(format!("JSON 解析失败: {}", e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> StrmResult<Self> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| StrmError::Config(format!("YAML 解析失败: {}", e)))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.exts.is_empty() {
            self.exts = DEFAULT_EXTS.iter().map(|e| e.to_string()).collect();
        }
        for endpoint in &mut self.endpoints {
            endpoint.base_url = endpoint.base_url.trim_end_matches('/').to_string();
        }
    }

    fn validate(&self) -> StrmResult<()> {
        if self.endpoints.is_empty() {
            return Err(StrmError::Config("至少需要配置一个 endpoint".to_string()));
        }
        for endpoint in &self.endpoints {
            if endpoint.base_url.is_empty() {
                return Err(StrmError::Config("endpoint 的 base-url 不能为空".to_string()));
            }
            let has_token = endpoint.token.as_deref().is_some_and(|t| !t.is_empty());
            let has_login = endpoint.username.as_deref().is_some_and(|u| !u.is_empty());
            if !has_token && !has_login {
                return Err(StrmError::Config(format!(
                    "{}: 需要配置 token 或 username/password",
                    endpoint.base_url
                )));
            }
            if endpoint.max_connections == 0 {
                return Err(StrmError::Config(format!(
                    "{}: max-connections 必须大于 0",
                    endpoint.base_url
                )));
            }
        }
        Ok(())
    }

    /// 端点实际使用的扩展名列表
    pub fn exts_for<'a>(&'a self, endpoint: &'a Endpoint) -> &'a [String] {
        if endpoint.exts.is_empty() {
            &self.exts
        } else {
            &endpoint.exts
        }
    }

    /// 记录数据库路径
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| {
            crate::dirs::data_dir()
                .map(|p| p.join("strmsync"))
                .unwrap_or_else(|| PathBuf::from(".strmsync"))
                .join("strmsync.db")
        })
    }

    /// 输出调试信息，密码和 token 只显示是否设置
    pub fn log_debug_info(&self) {
        for endpoint in &self.endpoints {
            debug!("base url: {}", endpoint.base_url);
            debug!("token: {}", mask(endpoint.token.as_deref()));
            debug!("username: {}", endpoint.username.as_deref().unwrap_or(""));
            debug!("password: {}", mask(endpoint.password.as_deref()));
            debug!("insecure tls verify: {}", endpoint.insecure_tls_verify);
            debug!("dirs: {:?}", endpoint.dirs);
            debug!("max connections: {}", endpoint.max_connections);
        }
        debug!("timeout: {}", self.timeout);
        debug!("create sub directory: {}", self.create_sub_directory);
        debug!("exts: {:?}", self.exts);
        debug!("alt exts: {:?}", self.alt_exts);
    }
}

fn mask(secret: Option<&str>) -> &'static str {
    match secret {
        Some(s) if !s.is_empty() => "******",
        _ => "(未设置)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_with_defaults() {
        let config = Config::from_json(
            r#"{
                "endpoints": [{
                    "base-url": "http://alist.local:5244/",
                    "username": "admin",
                    "password": "secret",
                    "inscure-tls-verify": true,
                    "dirs": [{
                        "local-directory": "/media/movies",
                        "remote-directories": ["/Movies"],
                        "not-recursive": true
                    }]
                }],
                "alt-exts": [".srt"]
            }"#,
        )
        .unwrap();

        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.base_url, "http://alist.local:5244");
        assert!(endpoint.insecure_tls_verify);
        assert_eq!(endpoint.max_connections, 5);
        assert!(endpoint.dirs[0].not_recursive);
        assert!(!endpoint.dirs[0].disabled);
        assert_eq!(config.timeout, 30);
        assert_eq!(config.loglevel, "info");
        assert!(config.exts.contains(&".mkv".to_string()));
        assert_eq!(config.alt_exts, vec![".srt".to_string()]);
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(
            r#"
database: /var/lib/strmsync/records.db
create-sub-directory: true
exts: [".mkv"]
endpoints:
  - base-url: https://pan.example.com
    token: abc
    max-connections: 2
    exts: [".mp4"]
    dirs:
      - local-directory: /media/tv
        remote-directories: ["/TV", "/Anime"]
        force-refresh: true
"#,
        )
        .unwrap();

        assert!(config.create_sub_directory);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/strmsync/records.db")
        );
        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.max_connections, 2);
        assert_eq!(endpoint.dirs[0].remote_directories.len(), 2);
        assert!(endpoint.dirs[0].force_refresh);
        assert_eq!(config.exts_for(endpoint), &[".mp4".to_string()]);
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let err = Config::from_json(r#"{"endpoints": [{"base-url": "http://a"}]}"#).unwrap_err();
        assert!(matches!(err, StrmError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(Config::from_json("{}").is_err());
    }

    #[test]
    fn test_load_unreadable_file() {
        let err = Config::load(Path::new("/nonexistent/strmsync.json")).unwrap_err();
        assert!(matches!(err, StrmError::Config(_)));
    }
}
