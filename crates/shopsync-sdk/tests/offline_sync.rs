//! 端到端：SDK + RemoteGateway + 内存脚本服务

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use shopsync_sdk::http_client::Params;
use shopsync_sdk::{
    ActionKind, CollectionName, RawResponse, Record, RemoteGateway, RemoteTransport, Result, ShopSyncConfig,
    ShopSyncError, ShopSyncSDK, Sleeper, SyncEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 内存里的表格脚本服务
#[derive(Debug, Default)]
struct MemorySheetService {
    sheets: Mutex<HashMap<String, Vec<Value>>>,
    failing_gets: AtomicUsize,
    posts_down: AtomicBool,
    gets: AtomicUsize,
    posts: AtomicUsize,
}

impl MemorySheetService {
    fn seed(&self, sheet: &str, rows: Vec<Value>) {
        self.sheets.lock().insert(sheet.to_string(), rows);
    }

    fn rows(&self, sheet: &str) -> Vec<Value> {
        self.sheets.lock().get(sheet).cloned().unwrap_or_default()
    }

    fn param<'a>(params: &'a Params, name: &str) -> &'a str {
        params.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str()).unwrap_or("")
    }
}

#[async_trait]
impl RemoteTransport for MemorySheetService {
    async fn get(&self, _url: &str, query: Params) -> Result<RawResponse> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_gets.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_gets.store(failing - 1, Ordering::SeqCst);
            return Err(ShopSyncError::Network("connection reset by peer".into()));
        }
        let rows = self.rows(Self::param(&query, "sheet"));
        Ok(RawResponse::json(200, json!({ "data": rows }).to_string()))
    }

    async fn post_form(&self, _url: &str, form: Params) -> Result<RawResponse> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if self.posts_down.load(Ordering::SeqCst) {
            return Ok(RawResponse::json(502, "Bad Gateway"));
        }

        let data: Value = serde_json::from_str(Self::param(&form, "data"))?;
        let id = data.get("id").cloned().unwrap_or(Value::Null);
        let mut sheets = self.sheets.lock();
        let rows = sheets.entry(Self::param(&form, "sheet").to_string()).or_default();
        match Self::param(&form, "action") {
            "add" => rows.push(data),
            "update" => {
                if let Some(row) = rows.iter_mut().find(|r| r.get("id") == Some(&id)) {
                    *row = data;
                }
            }
            "delete" => rows.retain(|r| r.get("id") != Some(&id)),
            other => {
                let body = json!({"status": "error", "message": format!("unknown action {}", other)});
                return Ok(RawResponse::json(200, body.to_string()));
            }
        }
        Ok(RawResponse::json(200, r#"{"status":"success"}"#))
    }
}

/// 不等待的时钟
#[derive(Debug, Default)]
struct InstantSleeper {
    sleeps: AtomicUsize,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    dir: TempDir,
    service: Arc<MemorySheetService>,
    sleeper: Arc<InstantSleeper>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            service: Arc::new(MemorySheetService::default()),
            sleeper: Arc::new(InstantSleeper::default()),
        }
    }

    fn config(&self) -> ShopSyncConfig {
        ShopSyncConfig::builder()
            .data_dir(self.dir.path())
            .namespace("corner-shop")
            .endpoint("https://script.example.com/exec")
            .build()
    }

    async fn open(&self) -> Arc<ShopSyncSDK> {
        let config = self.config();
        let gateway = RemoteGateway::new(self.service.clone(), self.sleeper.clone(), config.gateway_config());
        ShopSyncSDK::with_remote(config, Arc::new(gateway)).await.unwrap()
    }
}

fn stock_of(sdk: &ShopSyncSDK, id: &str) -> Option<i64> {
    sdk.record(CollectionName::Products, id).and_then(|r| r.get_i64("Stock"))
}

#[tokio::test]
async fn squashed_updates_flush_once_with_last_value() {
    let fx = Fixture::new();
    fx.service.seed("Products", vec![json!({"id": "P1", "Name": "Vase", "Stock": 10})]);
    let sdk = fx.open().await;
    sdk.sync().await.unwrap();

    let product = sdk.record(CollectionName::Products, "P1").unwrap();
    sdk.update_record(CollectionName::Products, product.clone().with_field("Stock", 5)).unwrap();
    sdk.update_record(CollectionName::Products, product.with_field("Stock", 3)).unwrap();

    let pending = sdk.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, ActionKind::Update);
    assert_eq!(pending[0].payload.get_i64("Stock"), Some(3));

    let report = sdk.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(sdk.pending_count(), 0);
    assert_eq!(stock_of(&sdk, "P1"), Some(3));
    assert_eq!(fx.service.posts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.service.rows("Products")[0]["Stock"], json!(3));
}

#[tokio::test]
async fn failed_delete_keeps_record_and_intent() {
    let fx = Fixture::new();
    fx.service.seed("Sales", vec![json!({"id": "S9", "Total": 40})]);
    let sdk = fx.open().await;
    sdk.sync().await.unwrap();

    fx.service.posts_down.store(true, Ordering::SeqCst);
    sdk.delete_record(CollectionName::Sales, "S9").unwrap();
    let mut events = sdk.subscribe_events();

    let report = sdk.sync().await.unwrap();

    let halted = report.halted.expect("flush should halt");
    assert_eq!(halted.id, "S9");
    assert_eq!(fx.service.posts.load(Ordering::SeqCst), 2);
    assert!(sdk.record(CollectionName::Sales, "S9").is_some());
    assert_eq!(sdk.pending_actions()[0].action, ActionKind::Delete);

    let mut saw_halt = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::FlushHalted { id, remaining, .. } = event {
            assert_eq!(id, "S9");
            assert_eq!(remaining, 1);
            saw_halt = true;
        }
    }
    assert!(saw_halt);

    // 服务恢复后下一轮完成删除
    fx.service.posts_down.store(false, Ordering::SeqCst);
    sdk.sync().await.unwrap();
    assert!(sdk.record(CollectionName::Sales, "S9").is_none());
    assert!(fx.service.rows("Sales").is_empty());
}

#[tokio::test]
async fn transient_read_failures_are_retried_transparently() {
    let fx = Fixture::new();
    fx.service.seed("Customers", vec![json!({"id": 42, "Name": "Amina"})]);
    // 第一个集合的前两次请求失败
    fx.service.failing_gets.store(2, Ordering::SeqCst);
    let sdk = fx.open().await;

    let report = sdk.sync().await.unwrap();

    assert_eq!(report.pull_failures().count(), 0);
    assert_eq!(fx.service.gets.load(Ordering::SeqCst), 6);
    assert_eq!(fx.sleeper.sleeps.load(Ordering::SeqCst), 2);
    let customers = sdk.records(CollectionName::Customers);
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].id, "42");
}

#[tokio::test]
async fn offline_work_survives_restart_and_flushes_on_reconnect() {
    let fx = Fixture::new();
    let created = {
        let sdk = fx.open().await;
        sdk.set_online(false);

        let mut fields = Map::new();
        fields.insert("Label".into(), json!("Electricity"));
        fields.insert("Amount".into(), json!(120));
        let record = sdk.create_record(CollectionName::Expenses, fields).unwrap();

        let report = sdk.sync().await.unwrap();
        assert!(report.skipped_offline);
        assert_eq!(fx.service.gets.load(Ordering::SeqCst), 0);

        sdk.shutdown().await.unwrap();
        record
    };

    let sdk = fx.open().await;
    assert_eq!(sdk.pending_count(), 1);
    assert_eq!(sdk.records(CollectionName::Expenses), vec![created.clone()]);

    sdk.set_online(false);
    sdk.set_online(true);
    for _ in 0..200 {
        if sdk.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(sdk.pending_count(), 0);
    let remote = fx.service.rows("Expenses");
    assert_eq!(remote.len(), 1);
    assert_eq!(Record::from_remote_value(remote[0].clone()), Some(created));
}

#[tokio::test]
async fn pull_failure_keeps_local_cache() {
    let fx = Fixture::new();
    fx.service.seed("Products", vec![json!({"id": "P1", "Stock": 2})]);
    let sdk = fx.open().await;
    sdk.sync().await.unwrap();

    // 所有读请求都失败：每个集合 3 次
    fx.service.failing_gets.store(usize::MAX, Ordering::SeqCst);
    fx.service.seed("Products", vec![]);

    let report = sdk.sync().await.unwrap();
    assert_eq!(report.pull_failures().count(), 4);
    assert_eq!(stock_of(&sdk, "P1"), Some(2));
}
