//! KV 存储模块 - 基于 sled 的本地键值存储
//!
//! 本模块提供：
//! - 设备级 sled 实例的打开（带锁重试）
//! - 命名 Tree 的获取
//! - 存储格式版本校验
//! - 持久化刷盘与单调 ID 生成

use std::path::{Path, PathBuf};

use sled::{Db, Tree};

use crate::error::{Result, StrikkeSDKError};

/// 元信息 Tree 名
const META_TREE: &str = "meta";
/// 格式版本键
const FORMAT_KEY: &[u8] = b"pending_store_format";

/// KV 存储统计
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub tree_count: usize,
    pub size_on_disk: u64,
}

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Db,
}

impl KvStore {
    /// 在 `base_path/kv` 下打开 sled 数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| StrikkeSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁（进程重启、热重载），重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    tracing::info!("KV 存储已打开: {}", kv_path.display());
                    return Ok(Self { base_path, db });
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::debug!("KV 存储被占用，{}ms 后重试 (#{})", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(StrikkeSDKError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 打开（不存在则创建）命名 Tree
    pub fn open_tree(&self, name: &str) -> Result<Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| StrikkeSDKError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))
    }

    /// 校验并记录存储格式版本
    ///
    /// 首次打开时写入 `current`；磁盘版本比 `current` 新时拒绝打开。
    pub fn ensure_format(&self, current: u32) -> Result<()> {
        let meta = self.open_tree(META_TREE)?;
        let stored = meta
            .get(FORMAT_KEY)?
            .map(|bytes| decode_u32(&bytes))
            .transpose()?;

        match stored {
            Some(version) if version > current => Err(StrikkeSDKError::Storage(format!(
                "本地存储格式版本 {} 高于当前 SDK 支持的 {}",
                version, current
            ))),
            Some(version) if version == current => Ok(()),
            _ => {
                meta.insert(FORMAT_KEY, current.to_be_bytes().to_vec())?;
                meta.flush()?;
                tracing::info!("本地存储格式版本已记录: {}", current);
                Ok(())
            }
        }
    }

    /// 生成单调递增 ID（跨重启保持递增）
    pub fn generate_id(&self) -> Result<u64> {
        self.db
            .generate_id()
            .map_err(|e| StrikkeSDKError::KvStore(format!("生成 ID 失败: {}", e)))
    }

    /// 刷盘，返回后此前所有写入均已持久化
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StrikkeSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub fn stats(&self) -> Result<KvStats> {
        Ok(KvStats {
            tree_count: self.db.tree_names().len(),
            size_on_disk: self.db.size_on_disk()?,
        })
    }
}

fn decode_u32(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StrikkeSDKError::Storage(format!("格式版本长度错误: {}", bytes.len())))?;
    Ok(u32::from_be_bytes(array))
}
