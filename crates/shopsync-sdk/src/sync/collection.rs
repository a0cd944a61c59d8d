//! 集合名称 - 受控枚举
//!
//! 每个集合对应远端表格中的一个 sheet，sheet 名即枚举名。

use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// 集合（与远端 sheet 名一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectionName {
    Products,
    Sales,
    Expenses,
    Customers,
}

impl CollectionName {
    /// 全部集合；拉取时并发执行，顺序只影响日志
    pub const ALL: [CollectionName; 4] = [
        CollectionName::Products,
        CollectionName::Customers,
        CollectionName::Sales,
        CollectionName::Expenses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Products => "Products",
            Self::Sales => "Sales",
            Self::Expenses => "Expenses",
            Self::Customers => "Customers",
        }
    }
}

impl FromStr for CollectionName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Products" => Ok(Self::Products),
            "Sales" => Ok(Self::Sales),
            "Expenses" => Ok(Self::Expenses),
            "Customers" => Ok(Self::Customers),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
