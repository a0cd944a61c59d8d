//! 远端网关 - 表格服务的读写协议
//!
//! - 读：`GET <endpoint>?action=read&sheet=<Name>&t=<时间戳>`，返回数组或 `{ data: [...] }`
//! - 写：`POST <endpoint>` 表单 `action=add|update|delete&sheet=<Name>&data=<JSON>`
//!
//! 传输成功不代表响应可信：HTML 响应、非 JSON、`status: "error"` 都按协议错误处理。
//! 传输失败与非 2xx 状态码按策略重试，协议错误不重试。

use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, Result, ShopSyncError};
use crate::http_client::{RawResponse, RemoteTransport};
use crate::storage::queue::{retry_with_backoff, ActionKind, RetryPolicy, Sleeper};
use crate::storage::Record;
use crate::sync::CollectionName;

/// 写入数据超过该大小时输出告警（仍然发送）
pub const DEFAULT_PAYLOAD_WARN_BYTES: usize = 500_000;

/// 一次远端往返的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResult {
    Success(Value),
    Failure { kind: FailureKind, message: String },
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncResult::Success(_))
    }

    pub fn failure(error: &ShopSyncError) -> Self {
        SyncResult::Failure {
            kind: error.failure_kind(),
            message: error.to_string(),
        }
    }
}

impl From<Result<Value>> for SyncResult {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => SyncResult::Success(value),
            Err(e) => SyncResult::failure(&e),
        }
    }
}

/// 协调器面向的远端抽象
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 拉取整个集合（有序）
    async fn fetch_collection(&self, collection: CollectionName) -> Result<Vec<Record>>;

    /// 提交一条变更
    async fn submit_action(
        &self,
        collection: CollectionName,
        action: ActionKind,
        payload: &Record,
    ) -> SyncResult;
}

/// 网关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 脚本服务地址
    pub endpoint: String,
    pub read_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
    pub payload_warn_bytes: usize,
}

impl GatewayConfig {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            read_retry: RetryPolicy::read(),
            write_retry: RetryPolicy::write(),
            payload_warn_bytes: DEFAULT_PAYLOAD_WARN_BYTES,
        }
    }
}

/// 带重试与响应校验的远端网关
#[derive(Debug, Clone)]
pub struct RemoteGateway {
    transport: Arc<dyn RemoteTransport>,
    sleeper: Arc<dyn Sleeper>,
    config: GatewayConfig,
}

impl RemoteGateway {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        sleeper: Arc<dyn Sleeper>,
        config: GatewayConfig,
    ) -> Self {
        Self { transport, sleeper, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// 发送一次 GET，非 2xx 视为传输失败（可重试）
    async fn get_once(&self, collection: CollectionName, cache_buster: &str) -> Result<RawResponse> {
        let query = vec![
            ("action", "read".to_string()),
            ("sheet", collection.as_str().to_string()),
            ("t", cache_buster.to_string()),
        ];
        let response = self.transport.get(&self.config.endpoint, query).await?;
        ensure_http_success(response)
    }

    async fn post_once(&self, form: Vec<(&'static str, String)>) -> Result<RawResponse> {
        let response = self.transport.post_form(&self.config.endpoint, form).await?;
        ensure_http_success(response)
    }

    async fn fetch_inner(&self, collection: CollectionName) -> Result<Vec<Record>> {
        let cache_buster = chrono::Utc::now().timestamp_millis().to_string();
        let label = format!("读取 {}", collection);
        let response = retry_with_backoff(&self.config.read_retry, self.sleeper.as_ref(), &label, |_| {
            self.get_once(collection, &cache_buster)
        })
        .await?;
        parse_read_response(collection, &response)
    }

    async fn submit_inner(
        &self,
        collection: CollectionName,
        action: ActionKind,
        payload: &Record,
    ) -> Result<Value> {
        let data = payload.to_json_string()?;
        if data.len() > self.config.payload_warn_bytes {
            warn!(
                "⚠️ {} 的写入数据过大 ({}KB)，同步可能失败",
                collection,
                data.len() / 1024
            );
        }

        let form = vec![
            ("action", action.wire_name().to_string()),
            ("sheet", collection.as_str().to_string()),
            ("data", data),
        ];
        let label = format!("{} {} id={}", action, collection, payload.id);
        let response = retry_with_backoff(&self.config.write_retry, self.sleeper.as_ref(), &label, |_| {
            self.post_once(form.clone())
        })
        .await?;
        parse_write_response(collection, &response)
    }
}

#[async_trait]
impl RemoteStore for RemoteGateway {
    async fn fetch_collection(&self, collection: CollectionName) -> Result<Vec<Record>> {
        match self.fetch_inner(collection).await {
            Ok(records) => {
                info!("📥 拉取 {} 成功: {} 条", collection, records.len());
                Ok(records)
            }
            Err(e) => {
                error!("❌ 拉取 {} 失败: {}", collection, e);
                Err(e)
            }
        }
    }

    async fn submit_action(
        &self,
        collection: CollectionName,
        action: ActionKind,
        payload: &Record,
    ) -> SyncResult {
        match self.submit_inner(collection, action, payload).await {
            Ok(value) => {
                debug!("📤 {} {} id={} 已确认", action, collection, payload.id);
                SyncResult::Success(value)
            }
            Err(e) => {
                error!("❌ 写入 {} 失败 ({} id={}): {}", collection, action, payload.id, e);
                SyncResult::failure(&e)
            }
        }
    }
}

fn ensure_http_success(response: RawResponse) -> Result<RawResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ShopSyncError::Network(format!("HTTP error! status: {}", response.status)))
    }
}

/// 公共校验：HTML 错误页、非 JSON、脚本级 status=error
fn parse_json_body(collection: CollectionName, response: &RawResponse) -> Result<Value> {
    if response.is_html() {
        return Err(ShopSyncError::Protocol(format!(
            "Server returned HTML error for {}. Check Script Permissions.",
            collection
        )));
    }

    let value: Value = serde_json::from_str(&response.body).map_err(|e| {
        ShopSyncError::Protocol(format!("Invalid JSON response for {}: {}", collection, e))
    })?;

    if let Value::Object(map) = &value {
        if map.get("status").and_then(Value::as_str) == Some("error") {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or("Script returned error status");
            return Err(ShopSyncError::Protocol(message.to_string()));
        }
    }

    Ok(value)
}

fn parse_read_response(collection: CollectionName, response: &RawResponse) -> Result<Vec<Record>> {
    let rows = match parse_json_body(collection, response)? {
        Value::Array(rows) => rows,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(rows)) => rows,
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(ShopSyncError::Protocol(format!(
                    "Unexpected data field for {}: {}",
                    collection, other
                )))
            }
        },
        other => {
            return Err(ShopSyncError::Protocol(format!(
                "Unexpected response for {}: {}",
                collection, other
            )))
        }
    };

    let total = rows.len();
    let records: Vec<Record> = rows.into_iter().filter_map(Record::from_remote_value).collect();
    if records.len() < total {
        warn!("⚠️ {} 中有 {} 行缺少 id，已跳过", collection, total - records.len());
    }
    Ok(records)
}

fn parse_write_response(collection: CollectionName, response: &RawResponse) -> Result<Value> {
    parse_json_body(collection, response)
}


#[cfg(test)]
mod tests {
    use super::test_helpers::ScriptedTransport;
    use super::*;
    use crate::storage::queue::retry_policy::test_helpers::RecordingSleeper;
    use serde_json::json;
    use std::time::Duration;

    const ENDPOINT: &str = "https://script.example.com/exec";

    fn gateway(transport: Arc<ScriptedTransport>, sleeper: Arc<RecordingSleeper>) -> RemoteGateway {
        RemoteGateway::new(transport, sleeper, GatewayConfig::new(ENDPOINT))
    }

    fn network_down() -> Result<RawResponse> {
        Err(ShopSyncError::Network("connection refused".into()))
    }

    #[tokio::test]
    async fn test_read_request_shape() {
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, "[]"))]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let records = gateway(transport.clone(), sleeper)
            .fetch_collection(CollectionName::Products)
            .await
            .unwrap();
        assert!(records.is_empty());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].url, ENDPOINT);
        assert_eq!(requests[0].param("action"), Some("read"));
        assert_eq!(requests[0].param("sheet"), Some("Products"));
        assert!(requests[0].param("t").unwrap().parse::<i64>().is_ok());
    }

    #[tokio::test]
    async fn test_read_recovers_after_two_transport_failures() {
        let body = json!([{"id": "P1", "Name": "Vase", "Stock": 4}]).to_string();
        let transport = Arc::new(ScriptedTransport::new([
            network_down(),
            Ok(RawResponse::json(503, "unavailable")),
            Ok(RawResponse::json(200, body)),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let records = gateway(transport.clone(), sleeper.clone())
            .fetch_collection(CollectionName::Products)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "P1");
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_millis(1500), Duration::from_millis(3000)]
        );
    }

    #[tokio::test]
    async fn test_read_gives_up_after_three_attempts() {
        let transport = Arc::new(ScriptedTransport::new([network_down(), network_down(), network_down()]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport.clone(), sleeper).fetch_collection(CollectionName::Sales).await;
        assert!(matches!(result, Err(ShopSyncError::Network(_))));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_html_with_ok_status_is_protocol_error() {
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::html(200, "<html>Sign in</html>"))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport.clone(), sleeper).fetch_collection(CollectionName::Sales).await;
        match result {
            Err(ShopSyncError::Protocol(message)) => assert!(message.contains("HTML")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_error_status_body_is_protocol_error() {
        let body = json!({"status": "error", "message": "Sheet not found"}).to_string();
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, body))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport, sleeper).fetch_collection(CollectionName::Expenses).await;
        match result {
            Err(ShopSyncError::Protocol(message)) => assert_eq!(message, "Sheet not found"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_status_without_message_uses_default() {
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, r#"{"status":"error"}"#))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport, sleeper).fetch_collection(CollectionName::Expenses).await;
        match result {
            Err(ShopSyncError::Protocol(message)) => assert_eq!(message, "Script returned error status"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_body_shapes() {
        let wrapped = json!({"data": [{"id": "C1"}, {"Name": "no id"}, {"id": 7}]}).to_string();
        let transport = Arc::new(ScriptedTransport::new([
            Ok(RawResponse::json(200, wrapped)),
            Ok(RawResponse::json(200, r#"{"status":"ok"}"#)),
            Ok(RawResponse::json(200, "not json")),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let gateway = gateway(transport, sleeper);

        let ids: Vec<_> = gateway
            .fetch_collection(CollectionName::Customers)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["C1", "7"]);

        assert!(gateway.fetch_collection(CollectionName::Customers).await.unwrap().is_empty());

        let result = gateway.fetch_collection(CollectionName::Customers).await;
        assert!(matches!(result, Err(ShopSyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_write_request_shape() {
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, r#"{"status":"success"}"#))]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let record = Record::new("P1").with_field("Stock", 3);

        let result = gateway(transport.clone(), sleeper)
            .submit_action(CollectionName::Products, ActionKind::Update, &record)
            .await;
        assert_eq!(result, SyncResult::Success(json!({"status": "success"})));

        let request = &transport.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.param("action"), Some("update"));
        assert_eq!(request.param("sheet"), Some("Products"));
        let data: Value = serde_json::from_str(request.param("data").unwrap()).unwrap();
        assert_eq!(data, json!({"id": "P1", "Stock": 3}));
    }

    #[tokio::test]
    async fn test_write_failure_after_two_attempts() {
        let transport = Arc::new(ScriptedTransport::new([network_down(), network_down(), network_down()]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport.clone(), sleeper.clone())
            .submit_action(CollectionName::Sales, ActionKind::Delete, &Record::new("S9"))
            .await;

        assert!(matches!(result, SyncResult::Failure { kind: FailureKind::Network, .. }));
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(sleeper.slept(), vec![Duration::from_millis(2000)]);
        assert_eq!(transport.requests()[0].param("action"), Some("delete"));
    }

    #[tokio::test]
    async fn test_write_error_status_is_protocol_failure() {
        let body = json!({"status": "error", "message": "Lock timeout"}).to_string();
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, body))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let result = gateway(transport, sleeper)
            .submit_action(CollectionName::Sales, ActionKind::Create, &Record::new("S1"))
            .await;
        assert_eq!(
            result,
            SyncResult::Failure {
                kind: FailureKind::Protocol,
                message: "Protocol error: Lock timeout".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_is_still_sent() {
        let transport = Arc::new(ScriptedTransport::new([Ok(RawResponse::json(200, "{}"))]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut config = GatewayConfig::new(ENDPOINT);
        config.payload_warn_bytes = 16;
        let gateway = RemoteGateway::new(transport.clone(), sleeper, config);

        let record = Record::new("E1").with_field("Note", "x".repeat(64));
        let result = gateway.submit_action(CollectionName::Expenses, ActionKind::Create, &record).await;
        assert!(result.is_success());
        assert_eq!(transport.requests()[0].param("action"), Some("add"));
    }
}
