use std::fmt;

use crate::remote::{RemoteError, RemoteFailureReason};

#[derive(Debug)]
pub enum StrikkeSDKError {
    KvStore(String),
    Serialization(String),
    IO(String),
    /// 本地存储格式不兼容（磁盘上的格式比当前 SDK 新）
    Storage(String),
    InvalidArgument(String),
    InvalidOperation(String),
    Config(String),
    ShuttingDown(String),
    /// 远端记录存储返回的错误
    Remote(RemoteError),
    Other(String),
}

impl fmt::Display for StrikkeSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrikkeSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            StrikkeSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StrikkeSDKError::IO(e) => write!(f, "IO error: {}", e),
            StrikkeSDKError::Storage(e) => write!(f, "Storage error: {}", e),
            StrikkeSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            StrikkeSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            StrikkeSDKError::Config(e) => write!(f, "Config error: {}", e),
            StrikkeSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            StrikkeSDKError::Remote(e) => write!(f, "Remote error: {}", e),
            StrikkeSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for StrikkeSDKError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StrikkeSDKError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sled::Error> for StrikkeSDKError {
    fn from(error: sled::Error) -> Self {
        StrikkeSDKError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for StrikkeSDKError {
    fn from(error: serde_json::Error) -> Self {
        StrikkeSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for StrikkeSDKError {
    fn from(error: std::io::Error) -> Self {
        StrikkeSDKError::IO(error.to_string())
    }
}

impl From<RemoteError> for StrikkeSDKError {
    fn from(error: RemoteError) -> Self {
        StrikkeSDKError::Remote(error)
    }
}

impl StrikkeSDKError {
    /// 获取远端失败原因（如果这是一个远端错误）
    pub fn remote_reason(&self) -> Option<&RemoteFailureReason> {
        match self {
            StrikkeSDKError::Remote(e) => Some(&e.reason),
            _ => None,
        }
    }

    /// 判断是否是本地存储不可用类错误
    ///
    /// 这类错误意味着离线保障已失效（编辑无处缓存），调用方应醒目地记录。
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            StrikkeSDKError::KvStore(_) | StrikkeSDKError::Storage(_) | StrikkeSDKError::IO(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StrikkeSDKError>;
