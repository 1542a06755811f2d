//! # 管理模块
//!
//! 管理端 JSON API：认证、分组、密钥、校验控制面、
//! 系统设置、仪表盘和请求日志。

pub mod handlers;
mod middleware;
mod response;
mod routes;
mod state;

pub use response::{ApiResponse, Pagination};
pub use routes::management_router;
pub use state::ManagementState;
