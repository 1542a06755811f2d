//! # 代理模块
//!
//! 转发面：密钥选取 → 上游改写 → 分发 → 结果分类 → 重试或收尾

mod executor;
mod request_log;
mod server;

pub use executor::{ProxyRequest, RequestExecutor};
pub use request_log::{REQUEST_TYPE_FINAL, REQUEST_TYPE_RETRY, RequestLogEntry, RequestLogService};
pub use server::{ProxyState, proxy_router};
