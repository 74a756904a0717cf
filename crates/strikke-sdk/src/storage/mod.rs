//! 存储模块 - 设备本地的待同步日志
//!
//! - KvStore: sled 实例、格式版本、刷盘
//! - PendingChangeStore: 待同步修改的记录/列举/删除/死信
//! - Entities: 数据实体定义

pub mod entities;
pub mod kv;
pub mod pending;

pub use entities::{fields, DeadLetter, FieldKey, FieldMap, PendingChange, RecordId};
pub use kv::{KvStats, KvStore};
pub use pending::{MemoryPendingChangeStore, PendingChangeStore, SledPendingChangeStore};
