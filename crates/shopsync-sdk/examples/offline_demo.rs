use serde_json::{json, Map, Value};
use shopsync_sdk::{CollectionName, Result, SaleCustomer, ShopSyncConfig, ShopSyncSDK, SyncEvent};

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 ShopSync 离线同步演示\n");

    let endpoint = std::env::var("SHOPSYNC_ENDPOINT")
        .unwrap_or_else(|_| "https://script.google.com/macros/s/REPLACE_ME/exec".to_string());
    let data_dir = std::env::temp_dir().join("shopsync-demo");

    let config = ShopSyncConfig::builder()
        .data_dir(&data_dir)
        .namespace("demo-shop")
        .endpoint(endpoint)
        .start_online(false)
        .build();
    let sdk = ShopSyncSDK::initialize(config).await?;

    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::PendingCountChanged { count } => println!("  🔔 待同步: {}", count),
                SyncEvent::PullFailed { collection, message, .. } => {
                    println!("  ⚠️ 拉取 {} 失败，使用本地数据: {}", collection, message)
                }
                SyncEvent::FlushHalted { id, message, remaining, .. } => {
                    println!("  ❌ 推送 {} 失败: {}（剩余 {}）", id, message, remaining)
                }
                other => println!("  📨 {:?}", other),
            }
        }
    });

    // 1. 离线录入商品并记一笔销售
    println!("1️⃣ 离线录入");
    let product = sdk.create_record(
        CollectionName::Products,
        fields(json!({"Name": "Argan Oil", "Price": 80, "Stock": 12})),
    )?;
    let sale = sdk.record_sale(
        &product.id,
        2,
        SaleCustomer {
            name: "Fatima".into(),
            phone: "0611223344".into(),
            address: "Marrakesh".into(),
        },
    )?;
    println!("   发票: {}", sale.get_str("InvoiceNumber").unwrap_or_default());
    println!("   待同步 {} 条", sdk.pending_count());

    // 2. 离线时同步是空操作
    println!("\n2️⃣ 离线同步");
    let report = sdk.sync().await?;
    println!("   skipped_offline = {}", report.skipped_offline);

    // 3. 恢复在线，调度器自动同步
    println!("\n3️⃣ 恢复在线");
    sdk.set_online(true);
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    let report = sdk.sync().await?;
    println!(
        "   推送 {} 条，剩余 {} 条，拉取失败 {} 个集合",
        report.flushed,
        report.remaining,
        report.pull_failures().count()
    );

    sdk.shutdown().await?;
    println!("\n✅ 演示结束");
    Ok(())
}
