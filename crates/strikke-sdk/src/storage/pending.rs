//! 待同步修改日志
//!
//! 每个 (记录, 字段) 最多保留一条最新修改；写入同一字段时整体替换旧条目（先删后加，
//! 同一事务内完成）。本地 ID 单调递增，替换后的新条目总是拿到新 ID，
//! 因此同步协调器按旧 ID 删除时不会误删在刷写期间写入的新值。

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use tracing::{debug, info, warn};

use crate::error::{Result, StrikkeSDKError};
use crate::storage::entities::{DeadLetter, FieldKey, PendingChange, RecordId};
use crate::storage::kv::KvStore;
use crate::version::PENDING_STORE_FORMAT;

const CHANGES_TREE: &str = "pending_changes";
const INDEX_TREE: &str = "pending_index";
const DEAD_LETTER_TREE: &str = "dead_letters";

#[async_trait]
pub trait PendingChangeStore: Debug + Send + Sync {
    /// 记录一条修改，替换同一 (记录, 字段) 上的旧条目
    async fn record(
        &self,
        record_id: RecordId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<PendingChange>;

    /// 全部待同步修改，不保证顺序
    async fn list_all(&self) -> Result<Vec<PendingChange>>;

    /// 按本地 ID 删除；不存在时不报错
    async fn remove(&self, id: u64) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// 把条目移入死信区，返回实际移动的数量
    async fn dead_letter(&self, ids: &[u64], reason: &str) -> Result<usize>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn clear_dead_letters(&self) -> Result<usize>;
}

fn validate_key(record_id: &RecordId, field: &str) -> Result<()> {
    if record_id.as_str().is_empty() {
        return Err(StrikkeSDKError::InvalidArgument("记录 ID 不能为空".to_string()));
    }
    if field.is_empty() {
        return Err(StrikkeSDKError::InvalidArgument("字段名不能为空".to_string()));
    }
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 基于 sled 的持久化实现
#[derive(Debug, Clone)]
pub struct SledPendingChangeStore {
    kv: KvStore,
    /// id(大端) → PendingChange(JSON)
    changes: Tree,
    /// FieldKey 编码 → id(大端)
    index: Tree,
    /// id(大端) → DeadLetter(JSON)
    dead_letters: Tree,
}

impl SledPendingChangeStore {
    pub fn open(kv: &KvStore) -> Result<Self> {
        kv.ensure_format(PENDING_STORE_FORMAT)?;
        let store = Self {
            kv: kv.clone(),
            changes: kv.open_tree(CHANGES_TREE)?,
            index: kv.open_tree(INDEX_TREE)?,
            dead_letters: kv.open_tree(DEAD_LETTER_TREE)?,
        };
        info!("待同步日志已打开，当前 {} 条", store.changes.len());
        Ok(store)
    }
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StrikkeSDKError::Serialization(format!("ID 长度错误: {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

fn tx_error(error: TransactionError<StrikkeSDKError>) -> StrikkeSDKError {
    match error {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

#[async_trait]
impl PendingChangeStore for SledPendingChangeStore {
    async fn record(
        &self,
        record_id: RecordId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<PendingChange> {
        validate_key(&record_id, field)?;

        let change = PendingChange {
            id: self.kv.generate_id()?,
            record_id,
            field: field.to_string(),
            value,
            timestamp: now_millis(),
        };
        let encoded = serde_json::to_vec(&change)?;
        let index_key = change.key().encode();
        let id_key = change.id.to_be_bytes();

        let replaced = (&self.changes, &self.index)
            .transaction(|(changes, index)| {
                let previous = index.insert(index_key.as_slice(), &id_key[..])?;
                let replaced = match previous {
                    Some(bytes) => {
                        let old_id = decode_id(&bytes).map_err(ConflictableTransactionError::Abort)?;
                        changes.remove(&old_id.to_be_bytes()[..])?;
                        Some(old_id)
                    }
                    None => None,
                };
                changes.insert(&id_key[..], encoded.as_slice())?;
                Ok(replaced)
            })
            .map_err(tx_error)?;

        self.kv.flush().await?;

        match replaced {
            Some(old_id) => debug!(
                "待同步修改已替换: {}.{} #{} → #{}",
                change.record_id, change.field, old_id, change.id
            ),
            None => debug!("待同步修改已记录: {}.{} #{}", change.record_id, change.field, change.id),
        }
        Ok(change)
    }

    async fn list_all(&self) -> Result<Vec<PendingChange>> {
        let mut result = Vec::new();
        for item in self.changes.iter() {
            let (key, bytes) = item?;
            match serde_json::from_slice::<PendingChange>(&bytes) {
                Ok(change) => result.push(change),
                Err(e) => warn!("跳过无法解析的待同步条目 {:?}: {}", &key[..], e),
            }
        }
        Ok(result)
    }

    async fn remove(&self, id: u64) -> Result<()> {
        let id_key = id.to_be_bytes();
        let removed = (&self.changes, &self.index)
            .transaction(|(changes, index)| {
                let Some(bytes) = changes.remove(&id_key[..])? else {
                    return Ok(false);
                };
                // 条目损坏时无法定位索引，只删条目；残留索引会在下次写同一字段时被覆盖
                if let Ok(change) = serde_json::from_slice::<PendingChange>(&bytes) {
                    let index_key = change.key().encode();
                    if let Some(current) = index.get(index_key.as_slice())? {
                        if current[..] == id_key[..] {
                            index.remove(index_key.as_slice())?;
                        }
                    }
                }
                Ok(true)
            })
            .map_err(tx_error)?;

        if removed {
            self.kv.flush().await?;
            debug!("待同步修改已删除: #{}", id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.changes.len())
    }

    async fn dead_letter(&self, ids: &[u64], reason: &str) -> Result<usize> {
        let failed_at = now_millis();
        let mut moved = 0;

        for id in ids {
            let id_key = id.to_be_bytes();
            let was_moved = (&self.changes, &self.index, &self.dead_letters)
                .transaction(|(changes, index, dead_letters)| {
                    let Some(bytes) = changes.remove(&id_key[..])? else {
                        return Ok(false);
                    };
                    let change: PendingChange = serde_json::from_slice(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(StrikkeSDKError::from(e)))?;
                    let index_key = change.key().encode();
                    if let Some(current) = index.get(index_key.as_slice())? {
                        if current[..] == id_key[..] {
                            index.remove(index_key.as_slice())?;
                        }
                    }
                    let letter = DeadLetter {
                        change,
                        reason: reason.to_string(),
                        failed_at,
                    };
                    let encoded = serde_json::to_vec(&letter)
                        .map_err(|e| ConflictableTransactionError::Abort(StrikkeSDKError::from(e)))?;
                    dead_letters.insert(&id_key[..], encoded)?;
                    Ok(true)
                })
                .map_err(tx_error)?;
            if was_moved {
                moved += 1;
            }
        }

        if moved > 0 {
            self.kv.flush().await?;
            warn!("{} 条修改被远端永久拒绝，已移入死信区: {}", moved, reason);
        }
        Ok(moved)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut result = Vec::new();
        for item in self.dead_letters.iter() {
            let (_, bytes) = item?;
            match serde_json::from_slice::<DeadLetter>(&bytes) {
                Ok(letter) => result.push(letter),
                Err(e) => warn!("跳过无法解析的死信条目: {}", e),
            }
        }
        Ok(result)
    }

    async fn clear_dead_letters(&self) -> Result<usize> {
        let count = self.dead_letters.len();
        self.dead_letters.clear()?;
        self.kv.flush().await?;
        Ok(count)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    changes: BTreeMap<u64, PendingChange>,
    dead_letters: Vec<DeadLetter>,
}

/// 基于内存的实现，进程退出即丢失
///
/// 用于测试以及没有可写数据目录的宿主。
#[derive(Debug, Default)]
pub struct MemoryPendingChangeStore {
    state: Mutex<MemoryState>,
}

impl MemoryPendingChangeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingChangeStore for MemoryPendingChangeStore {
    async fn record(
        &self,
        record_id: RecordId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<PendingChange> {
        validate_key(&record_id, field)?;
        let key = FieldKey::new(record_id, field);

        let mut state = self.state.lock();
        state.changes.retain(|_, existing| existing.key() != key);
        state.next_id += 1;
        let change = PendingChange {
            id: state.next_id,
            record_id: key.record_id,
            field: key.field,
            value,
            timestamp: now_millis(),
        };
        state.changes.insert(change.id, change.clone());
        Ok(change)
    }

    async fn list_all(&self) -> Result<Vec<PendingChange>> {
        Ok(self.state.lock().changes.values().cloned().collect())
    }

    async fn remove(&self, id: u64) -> Result<()> {
        self.state.lock().changes.remove(&id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.lock().changes.len())
    }

    async fn dead_letter(&self, ids: &[u64], reason: &str) -> Result<usize> {
        let failed_at = now_millis();
        let mut state = self.state.lock();
        let mut moved = 0;
        for id in ids {
            if let Some(change) = state.changes.remove(id) {
                state.dead_letters.push(DeadLetter {
                    change,
                    reason: reason.to_string(),
                    failed_at,
                });
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().dead_letters.clone())
    }

    async fn clear_dead_letters(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let count = state.dead_letters.len();
        state.dead_letters.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_sled(dir: &TempDir) -> SledPendingChangeStore {
        let kv = KvStore::new(dir.path()).await.unwrap();
        SledPendingChangeStore::open(&kv).unwrap()
    }

    async fn assert_coalesces(store: &dyn PendingChangeStore) {
        for row in 1..=5 {
            store.record(RecordId::from(42u64), "current_row", json!(row)).await.unwrap();
        }
        store.record(RecordId::from(42u64), "notes", json!("rib")).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let row = all.iter().find(|c| c.field == "current_row").unwrap();
        assert_eq!(row.value, json!(5));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sled_store_coalesces_per_field() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_sled(&temp_dir).await;
        assert_coalesces(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store_coalesces_per_field() {
        let store = MemoryPendingChangeStore::new();
        assert_coalesces(&store).await;
    }

    #[tokio::test]
    async fn test_changes_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let recorded = {
            let store = open_sled(&temp_dir).await;
            store.record(RecordId::from(7u64), "notes", json!("k2p2")).await.unwrap()
        };

        let store = open_sled(&temp_dir).await;
        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![recorded]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_sled(&temp_dir).await;
        let change = store.record(RecordId::from(1u64), "current_row", json!(3)).await.unwrap();

        store.remove(change.id).await.unwrap();
        store.remove(change.id).await.unwrap();
        store.remove(9_999).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removing_replaced_id_keeps_newer_value() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_sled(&temp_dir).await;
        let old = store.record(RecordId::from(1u64), "current_row", json!(7)).await.unwrap();
        let new = store.record(RecordId::from(1u64), "current_row", json!(9)).await.unwrap();
        assert!(new.id > old.id);

        // 协调器拿着旧快照删除旧 ID
        store.remove(old.id).await.unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, json!(9));

        // 索引仍指向新条目，再次写入依旧替换
        store.record(RecordId::from(1u64), "current_row", json!(10)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_sled(&temp_dir).await;
        let a = store.record(RecordId::from(5u64), "current_row", json!(1)).await.unwrap();
        let b = store.record(RecordId::from(6u64), "current_row", json!(2)).await.unwrap();

        let moved = store.dead_letter(&[a.id, 12_345], "record not found").await.unwrap();
        assert_eq!(moved, 1);

        let pending = store.list_all().await.unwrap();
        assert_eq!(pending, vec![b]);
        let letters = store.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].change, a);
        assert_eq!(letters[0].reason, "record not found");

        assert_eq!(store.clear_dead_letters().await.unwrap(), 1);
        assert!(store.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_skips_corrupt_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_sled(&temp_dir).await;
        store.record(RecordId::from(1u64), "notes", json!("ok")).await.unwrap();
        store.changes.insert(u64::MAX.to_be_bytes(), b"not json".to_vec()).unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        store.remove(u64::MAX).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_keys() {
        let store = MemoryPendingChangeStore::new();
        assert!(store.record(RecordId::from(""), "notes", json!(1)).await.is_err());
        assert!(store.record(RecordId::from(1u64), "", json!(1)).await.is_err());
    }
}
