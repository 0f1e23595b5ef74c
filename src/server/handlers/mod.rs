// API处理器模块

pub mod folders;
pub mod system;
pub mod tasks;

pub use folders::*;
pub use system::*;
pub use tasks::*;

use crate::registry::RegistryError;
use serde::Serialize;

/// 统一API响应格式
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }

    /// 登记器错误转响应
    pub fn from_registry_error(e: &RegistryError) -> Self {
        let code = match e {
            RegistryError::Creation(_) | RegistryError::Access(_) => 400,
            RegistryError::Task(_) => 409,
            RegistryError::Initialization(_)
            | RegistryError::Store(_)
            | RegistryError::Engine(_) => 500,
        };
        Self::error(code, e.to_string())
    }
}
