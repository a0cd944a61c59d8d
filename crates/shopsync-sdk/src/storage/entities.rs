//! 记录实体 - 表格中的一行
//!
//! 记录由客户端生成的全局唯一 `id` 加任意列组成，列顺序与表头一致。
//! `id` 创建后不再变化，是本地与远端之间的关联键。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一条业务记录（商品、销售、支出、客户）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// 客户端生成的唯一 ID
    pub id: String,
    /// 其余列（列名 → 值）
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// 使用指定 id 创建空记录
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// 生成新 id（UUID v4）并填入字段；字段中的 `id` 会被忽略
    pub fn with_generated_id(mut fields: Map<String, Value>) -> Self {
        fields.remove("id");
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fields,
        }
    }

    /// 设置字段（builder 风格）
    pub fn with_field<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        let key = key.into();
        if key == "id" {
            return;
        }
        self.fields.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// 数值列读取；表格里数字有时以字符串形式出现（"12.5"）
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// 从远端返回的一行解析记录
    ///
    /// 表格导出的 id 可能是数字，统一转成字符串；没有可用 id 的行返回 None。
    pub fn from_remote_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = match fields.remove("id")? {
            Value::String(s) if !s.trim().is_empty() => s,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { id, fields })
    }

    /// 序列化为写接口 `data` 字段使用的 JSON 字符串
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
