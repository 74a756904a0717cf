//! PostgREST 远端记录存储 - 托管关系库的 REST 接口
//!
//! `PATCH {base_url}/rest/v1/{table}?id=eq.{record_id}`，请求体为字段表。

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StrikkeSDKError};
use crate::remote::{RemoteError, RemoteFailureReason, RemoteRecordStore};
use crate::storage::entities::{fields, FieldMap, RecordId};

/// 错误响应体最多保留的字符数
const MAX_ERROR_BODY: usize = 512;

/// PostgREST 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgrestConfig {
    /// 项目地址，例如 https://xyz.supabase.co
    pub base_url: String,
    /// 公共 API key（anon key）
    pub api_key: String,
    /// 目标表
    pub table: String,
    /// 连接超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 请求超时（毫秒）
    pub request_timeout_ms: u64,
}

impl PostgrestConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: fields::PROJECTS_TABLE.to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 20_000,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), self.table)
    }
}

/// 基于 reqwest 的 PostgREST 适配器
pub struct PostgrestRecordStore {
    client: Client,
    config: PostgrestConfig,
    /// 登录后的用户 JWT；未登录时使用 api key 作为 bearer
    access_token: RwLock<Option<String>>,
}

impl PostgrestRecordStore {
    pub fn new(config: PostgrestConfig) -> Result<Self> {
        if config.base_url.is_empty() || config.table.is_empty() {
            return Err(StrikkeSDKError::Config("PostgREST base_url/table 不能为空".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(crate::version::version_string())
            .build()
            .map_err(|e| StrikkeSDKError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ PostgREST 客户端已创建 ({})", config.table_url());

        Ok(Self {
            client,
            config,
            access_token: RwLock::new(None),
        })
    }

    /// 更新用户访问令牌（登录/刷新/登出时由宿主调用）
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone())
    }
}

fn classify_transport_error(error: &reqwest::Error) -> RemoteFailureReason {
    if error.is_timeout() {
        RemoteFailureReason::NetworkTimeout
    } else if error.is_connect() {
        RemoteFailureReason::NetworkUnavailable
    } else {
        RemoteFailureReason::Unknown(error.to_string())
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl RemoteRecordStore for PostgrestRecordStore {
    async fn apply_update(
        &self,
        record_id: &RecordId,
        fields: &FieldMap,
    ) -> std::result::Result<(), RemoteError> {
        debug!("PATCH {} id={} 字段 {:?}", self.config.table, record_id, fields.keys().collect::<Vec<_>>());

        let response = self
            .client
            .patch(self.config.table_url())
            .query(&[("id", format!("eq.{}", record_id))])
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.bearer())
            .header("Prefer", "return=minimal")
            .json(fields)
            .send()
            .await
            .map_err(|e| RemoteError::new(classify_transport_error(&e), e.to_string()))?;

        let status = response.status().as_u16();
        match RemoteFailureReason::from_http_status(status) {
            None => Ok(()),
            Some(reason) => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::new(reason, truncate_body(body)))
            }
        }
    }
}
