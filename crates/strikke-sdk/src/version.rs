//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Pending Store Format** → 本模块常量，随本地 sled 布局变化递增
//! - **Runtime Metadata** → vergen 在 build.rs 中生成

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成）
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 当前 SDK 写入的待同步日志格式版本。
///
/// 打开本地存储时校验：若磁盘上的格式版本 > 此值则拒绝打开（防 downgrade 后误读新布局）。
pub const PENDING_STORE_FORMAT: u32 = 1;

/// 形如 `strikke-sdk/0.1.0 (abc1234)` 的版本描述，用于日志与 User-Agent
pub fn version_string() -> String {
    format!("strikke-sdk/{} ({})", SDK_VERSION, GIT_SHA)
}
