// Download Registry Library
// 下载任务登记与对账核心库

// 持久化记录存储
pub mod store;

// 目录访问授权
pub mod access;

// 传输引擎
pub mod engine;

// 任务登记器
pub mod registry;

// 配置管理模块
pub mod config;

// 日志
pub mod logging;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use access::{AccessTokenList, FolderAccessResolver, FolderHandle};
pub use config::AppConfig;
pub use engine::{HttpTransferEngine, TransferEngine, TransferOperation};
pub use registry::{
    RegistryError, RegistryEvent, RegistryOptions, TaskError, TaskHandle, TaskListView,
    TaskRecord, TaskRegistry, TaskSnapshot, TaskStatus,
};
pub use server::AppState;
pub use store::{MemoryRecordStore, RecordNamespace, RecordStore, SqliteRecordStore};
