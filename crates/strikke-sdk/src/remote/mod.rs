//! 远端记录存储
//!
//! SDK 只依赖"按 ID 对一条记录做部分字段更新"这一能力。更新必须是字段级覆盖
//! （不是增量），因此重发已经生效的更新是无害的。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::entities::{FieldMap, RecordId};

pub mod postgrest;

pub use postgrest::{PostgrestConfig, PostgrestRecordStore};

/// 远端写入失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试
    ServerError(u16),
    /// 认证失败 - 重新登录后可重试
    AuthFailure,
    /// 限流 - 下个周期重试
    RateLimited,
    /// 权限不足 - 不重试
    Forbidden,
    /// 记录不存在 - 不重试
    NotFound,
    /// 请求被拒绝（校验失败等 4xx）- 不重试
    Rejected(u16),
    /// 未知错误
    Unknown(String),
}

impl RemoteFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteFailureReason::NetworkTimeout => true,
            RemoteFailureReason::NetworkUnavailable => true,
            RemoteFailureReason::ServerError(code) => (500..600).contains(code),
            RemoteFailureReason::AuthFailure => true,
            RemoteFailureReason::RateLimited => true,
            RemoteFailureReason::Forbidden => false,
            RemoteFailureReason::NotFound => false,
            RemoteFailureReason::Rejected(_) => false,
            RemoteFailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 按 HTTP 状态码分类；2xx 返回 None
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(RemoteFailureReason::AuthFailure),
            403 => Some(RemoteFailureReason::Forbidden),
            404 => Some(RemoteFailureReason::NotFound),
            408 => Some(RemoteFailureReason::NetworkTimeout),
            429 => Some(RemoteFailureReason::RateLimited),
            400..=499 => Some(RemoteFailureReason::Rejected(status)),
            500..=599 => Some(RemoteFailureReason::ServerError(status)),
            other => Some(RemoteFailureReason::Unknown(format!("HTTP {}", other))),
        }
    }
}

impl fmt::Display for RemoteFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFailureReason::NetworkTimeout => write!(f, "network timeout"),
            RemoteFailureReason::NetworkUnavailable => write!(f, "network unavailable"),
            RemoteFailureReason::ServerError(code) => write!(f, "server error {}", code),
            RemoteFailureReason::AuthFailure => write!(f, "authentication failed"),
            RemoteFailureReason::RateLimited => write!(f, "rate limited"),
            RemoteFailureReason::Forbidden => write!(f, "forbidden"),
            RemoteFailureReason::NotFound => write!(f, "record not found"),
            RemoteFailureReason::Rejected(code) => write!(f, "rejected with {}", code),
            RemoteFailureReason::Unknown(msg) => write!(f, "unknown: {}", msg),
        }
    }
}

/// 远端写入错误
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct RemoteError {
    pub reason: RemoteFailureReason,
    pub message: String,
}

impl RemoteError {
    pub fn new(reason: RemoteFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

/// 远端记录存储（由宿主或内置适配器实现）
#[async_trait]
pub trait RemoteRecordStore: Send + Sync {
    /// 对 `record_id` 应用部分字段更新
    async fn apply_update(
        &self,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> std::result::Result<(), RemoteError>;
}

/// 测试用远端：记录调用，可按记录注入失败和延迟
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct ScriptedRemote {
        calls: Mutex<Vec<(RecordId, FieldMap)>>,
        state: Mutex<HashMap<RecordId, FieldMap>>,
        failing: Mutex<HashMap<RecordId, RemoteFailureReason>>,
        fail_all: Mutex<Option<RemoteFailureReason>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedRemote {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn fail_record(&self, record_id: impl Into<RecordId>, reason: RemoteFailureReason) {
            self.failing.lock().insert(record_id.into(), reason);
        }

        pub(crate) fn fail_all(&self, reason: RemoteFailureReason) {
            *self.fail_all.lock() = Some(reason);
        }

        pub(crate) fn heal(&self) {
            self.failing.lock().clear();
            *self.fail_all.lock() = None;
        }

        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = Some(delay);
        }

        pub(crate) fn calls(&self) -> Vec<(RecordId, FieldMap)> {
            self.calls.lock().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        /// 远端当前保存的字段值
        pub(crate) fn applied(&self, record_id: impl Into<RecordId>) -> Option<FieldMap> {
            self.state.lock().get(&record_id.into()).cloned()
        }
    }

    #[async_trait]
    impl RemoteRecordStore for ScriptedRemote {
        async fn apply_update(
            &self,
            record_id: &RecordId,
            fields: &FieldMap,
        ) -> std::result::Result<(), RemoteError> {
            self.calls.lock().push((record_id.clone(), fields.clone()));

            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let failure = self
                .failing
                .lock()
                .get(record_id)
                .cloned()
                .or_else(|| self.fail_all.lock().clone());
            if let Some(reason) = failure {
                return Err(RemoteError::new(reason, "scripted failure"));
            }

            let mut state = self.state.lock();
            let row = state.entry(record_id.clone()).or_default();
            for (field, value) in fields {
                row.insert(field.clone(), value.clone());
            }
            Ok(())
        }
    }
}
