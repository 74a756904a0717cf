//! 待同步日志的数据实体定义

use std::fmt;

use serde::{Deserialize, Serialize};

/// 一次远端部分更新携带的字段表（field → value）
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// 常用字段与表名
pub mod fields {
    /// 远端项目表
    pub const PROJECTS_TABLE: &str = "knitting_projects";
    /// 行计数器当前行
    pub const CURRENT_ROW: &str = "current_row";
    /// 项目笔记
    pub const NOTES: &str = "notes";
}

/// 远端记录 ID
///
/// 远端主键既可能是整数也可能是 UUID，统一以字符串形式保存。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// (记录, 字段) 键，待同步日志中每个键最多一条
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub record_id: RecordId,
    pub field: String,
}

impl FieldKey {
    pub fn new(record_id: RecordId, field: impl Into<String>) -> Self {
        Self {
            record_id,
            field: field.into(),
        }
    }

    /// 索引键编码：4 字节大端记录 ID 长度 + 记录 ID + 字段名
    ///
    /// 带长度前缀，避免 ("ab", "c") 与 ("a", "bc") 冲突。
    pub fn encode(&self) -> Vec<u8> {
        let record = self.record_id.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + record.len() + self.field.len());
        key.extend_from_slice(&(record.len() as u32).to_be_bytes());
        key.extend_from_slice(record);
        key.extend_from_slice(self.field.as_bytes());
        key
    }
}

/// 一条缓冲中的字段修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// 本地单调递增 ID，由存储在插入时分配
    pub id: u64,
    pub record_id: RecordId,
    pub field: String,
    pub value: serde_json::Value,
    /// 创建时间（毫秒），仅供参考
    pub timestamp: i64,
}

impl PendingChange {
    pub fn key(&self) -> FieldKey {
        FieldKey::new(self.record_id.clone(), self.field.clone())
    }
}

/// 被远端永久拒绝的修改，不再重试但保留以供排查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub change: PendingChange,
    pub reason: String,
    pub failed_at: i64,
}
