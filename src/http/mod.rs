// HTTP 模块
//
// 请求描述、传输层与请求管线

mod pipeline;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{AuthScheme, RequestPipeline, SignFn};
pub use transport::{HttpTransport, ReqwestTransport};
pub use types::{
    BodyData, FilePart, HttpBody, HttpRequest, MultipartBody, RawResponse, SendProgress,
};
