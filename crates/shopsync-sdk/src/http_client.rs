//! HTTP 传输层
//!
//! 只负责把请求发出去、把原始响应带回来，不做重试和内容校验（由 gateway 负责）。
//! 远端是部署在表格前面的脚本服务，有两个限制：
//! - 不带 cookie（多账号登录时会触发跨域问题）
//! - 不加自定义请求头（否则会触发预检请求，脚本服务不支持）

use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::error::{ShopSyncError, Result};
use crate::sdk::HttpClientConfig;

/// 表单/查询参数
pub type Params = Vec<(&'static str, String)>;

/// 原始 HTTP 响应
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl RawResponse {
    /// JSON 响应（测试与自定义传输层使用）
    pub fn json<S: Into<String>>(status: u16, body: S) -> Self {
        Self {
            status,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: body.into(),
        }
    }

    /// HTML 响应（脚本崩溃或授权页）
    pub fn html<S: Into<String>>(status: u16, body: S) -> Self {
        Self {
            status,
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }
}

/// 传输层抽象（reqwest 实现之外，测试和宿主可以自行注入）
#[async_trait]
pub trait RemoteTransport: Send + Sync + std::fmt::Debug {
    /// GET url?query
    async fn get(&self, url: &str, query: Params) -> Result<RawResponse>;

    /// POST application/x-www-form-urlencoded
    async fn post_form(&self, url: &str, form: Params) -> Result<RawResponse>;
}

/// 基于 reqwest 的传输层
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建新的 HTTP 客户端
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        // 默认跟随重定向（脚本服务的响应总是 302 到内容域名）
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| ShopSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 客户端已创建");

        Ok(Self { client })
    }

    async fn read_response(response: reqwest::Response) -> Result<RawResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| ShopSyncError::Network(format!("读取响应失败: {}", e)))?;
        debug!("HTTP {} ({:?}), {} bytes", status, content_type, body.len());
        Ok(RawResponse { status, content_type, body })
    }
}

#[async_trait]
impl RemoteTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: Params) -> Result<RawResponse> {
        let response = self.client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ShopSyncError::Network(format!("请求失败: {}", e)))?;
        Self::read_response(response).await
    }

    async fn post_form(&self, url: &str, form: Params) -> Result<RawResponse> {
        let response = self.client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ShopSyncError::Network(format!("请求失败: {}", e)))?;
        Self::read_response(response).await
    }
}
