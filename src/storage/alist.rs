use super::{RemoteEntry, RemoteLister};
use crate::config::Endpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// AList API 的统一响应包装
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct MeData {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<ListItem>>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    sign: String,
}

/// AList 服务器客户端
pub struct AlistClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    name: String,
}

impl AlistClient {
    /// 登录并返回客户端，配置了 token 时直接使用 token
    pub async fn login(endpoint: &Endpoint, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(endpoint.insecure_tls_verify)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;

        let base_url = endpoint.base_url.trim_end_matches('/').to_string();
        let mut client = Self {
            http,
            name: format!("alist:{}", base_url),
            base_url,
            token: String::new(),
        };

        match endpoint.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => client.token = token.to_string(),
            None => {
                let data: LoginData = client
                    .call(
                        "/api/auth/login",
                        json!({
                            "username": endpoint.username.as_deref().unwrap_or_default(),
                            "password": endpoint.password.as_deref().unwrap_or_default(),
                        }),
                    )
                    .await
                    .context("登录失败")?;
                client.token = data.token;
            }
        }

        let me: MeData = client.get("/api/me").await.context("获取用户信息失败")?;
        info!("{} 登录成功, 用户名: {}", client.base_url, me.username);

        Ok(client)
    }

    async fn call<T: DeserializeOwned>(&self, api: &str, body: serde_json::Value) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, api))
            .header("Authorization", &self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<ApiResponse<T>>()
            .await?;
        Self::unwrap_response(api, resp)
    }

    async fn get<T: DeserializeOwned>(&self, api: &str) -> Result<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, api))
            .header("Authorization", &self.token)
            .send()
            .await?
            .error_for_status()?
            .json::<ApiResponse<T>>()
            .await?;
        Self::unwrap_response(api, resp)
    }

    fn unwrap_response<T>(api: &str, resp: ApiResponse<T>) -> Result<T> {
        if resp.code != 200 {
            return Err(anyhow!("{} 返回错误 {}: {}", api, resp.code, resp.message));
        }
        resp.data
            .ok_or_else(|| anyhow!("{} 返回数据为空", api))
    }

    /// 文件的直接下载地址，带签名时附加 sign 参数
    fn raw_url(&self, dir: &str, item: &ListItem) -> String {
        let mut url = format!(
            "{}/d{}/{}",
            self.base_url,
            dir.trim_end_matches('/'),
            item.name
        );
        if !item.sign.is_empty() {
            url.push_str("?sign=");
            url.push_str(&item.sign);
        }
        url
    }
}

#[async_trait]
impl RemoteLister for AlistClient {
    async fn list(&self, path: &str, force_refresh: bool) -> Result<Vec<RemoteEntry>> {
        let data: ListData = self
            .call(
                "/api/fs/list",
                json!({
                    "path": path,
                    "password": "",
                    "page": 1,
                    "per_page": 0,
                    "refresh": force_refresh,
                }),
            )
            .await?;

        let items = data.content.unwrap_or_default();
        debug!("{} 返回 {} 个条目", path, items.len());

        Ok(items
            .into_iter()
            .map(|item| RemoteEntry {
                raw_url: self.raw_url(path, &item),
                name: item.name,
                is_dir: item.is_dir,
                size: item.size,
            })
            .collect())
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn name(&self) -> &str {
        &self.name
    }
}
