// Cloud Service Rust Library
// 多网盘统一访问核心库

// 认证模块（凭证与刷新回调）
pub mod auth;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// HTTP 请求管线
pub mod http;

// 日志系统
pub mod logging;

// 网盘服务商实现
pub mod provider;

// 上传引擎模块
pub mod uploader;

// 🔥 公共模块（进度汇报、单飞刷新）
pub mod common;

// 导出常用类型
pub use auth::{refresh_fn, CookieRefreshedFn, Credential, RefreshHandler};
pub use config::AppConfig;
pub use error::{CloudResult, CloudServiceError, ErrorKind};
pub use http::{HttpTransport, RawResponse, ReqwestTransport};
pub use provider::{
    copy_item, move_items, remove_items, search_files, CloudBatching, CloudCopying,
    CloudFileProvider, CloudItem, CloudSearching, CloudSpaceInformation, CloudUser,
    DownloadRequest, ProviderContext, ProviderKind, UploadOptions, UploadResult,
};
pub use uploader::{LocalFile, RapidUploadChecker, RapidUploadHash};

pub use common::{progress_channel, ProgressHandler, ProgressReport};
