// 统一错误类型
//
// 所有 provider 操作、请求管线与上传引擎共用同一错误通道

use crate::http::RawResponse;
use std::path::PathBuf;
use thiserror::Error;

/// 云服务操作结果
pub type CloudResult<T> = std::result::Result<T, CloudServiceError>;

/// 云服务错误
///
/// 传输层成功之后产生的错误都会携带原始响应，可通过 [`CloudServiceError::response`] 获取
#[derive(Debug, Error)]
pub enum CloudServiceError {
    /// 网络/DNS/TLS/超时等传输层失败
    #[error("网络请求失败: {message}")]
    Transport { message: String },

    /// 授权失效且无法刷新（未配置刷新回调，或刷新后依然 401）
    #[error("授权已失效: HTTP {}", .response.status())]
    Unauthorized { response: Box<RawResponse> },

    /// 服务端在响应体中返回的业务错误
    #[error("服务端错误: code={code}, message={}", .message.as_deref().unwrap_or("-"))]
    Service {
        code: i64,
        message: Option<String>,
        response: Option<Box<RawResponse>>,
    },

    /// 响应中缺少预期字段
    #[error("响应解析失败: {reason}")]
    ResponseDecode {
        reason: String,
        response: Option<Box<RawResponse>>,
    },

    /// 当前服务不支持该操作
    #[error("当前服务不支持该操作")]
    Unsupported,

    /// 待上传的本地文件不存在或不可读
    #[error("上传文件不存在: {0:?}")]
    UploadFileNotExist(PathBuf),

    /// 调用方取消了上传
    #[error("上传已取消")]
    Cancelled,

    /// 本地文件读写失败
    #[error("本地文件读写失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误类别，供调用方决定提示文案或重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Unauthorized,
    Service,
    ResponseDecode,
    Unsupported,
    FileNotFound,
    Cancelled,
    Io,
}

impl CloudServiceError {
    /// 构造传输层错误
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// 构造业务错误（不附带响应）
    pub fn service(code: i64, message: Option<String>) -> Self {
        Self::Service {
            code,
            message,
            response: None,
        }
    }

    /// 构造解析错误并附带原始响应
    pub fn decode(reason: impl Into<String>, response: &RawResponse) -> Self {
        Self::ResponseDecode {
            reason: reason.into(),
            response: Some(Box::new(response.clone())),
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Service { .. } => ErrorKind::Service,
            Self::ResponseDecode { .. } => ErrorKind::ResponseDecode,
            Self::Unsupported => ErrorKind::Unsupported,
            Self::UploadFileNotExist(_) => ErrorKind::FileNotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// 是否可由调用方重试（仅传输层错误）
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// 业务错误码
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Service { code, .. } => Some(*code),
            Self::Unauthorized { response } => Some(response.status() as i64),
            _ => None,
        }
    }

    /// 传输成功时的原始响应
    pub fn response(&self) -> Option<&RawResponse> {
        match self {
            Self::Unauthorized { response } => Some(response),
            Self::Service { response, .. } | Self::ResponseDecode { response, .. } => {
                response.as_deref()
            }
            _ => None,
        }
    }

    /// 为业务错误补上原始响应
    pub(crate) fn with_response(self, raw: &RawResponse) -> Self {
        match self {
            Self::Service {
                code,
                message,
                response: None,
            } => Self::Service {
                code,
                message,
                response: Some(Box::new(raw.clone())),
            },
            Self::ResponseDecode {
                reason,
                response: None,
            } => Self::ResponseDecode {
                reason,
                response: Some(Box::new(raw.clone())),
            },
            other => other,
        }
    }
}

impl From<reqwest::Error> for CloudServiceError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("请求超时: {}", err)
        } else if err.is_connect() {
            format!("连接失败: {}", err)
        } else {
            err.to_string()
        };
        Self::Transport { message }
    }
}
