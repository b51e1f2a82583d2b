//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod progress;
mod refresh_coordinator;

pub use progress::{progress_channel, ProgressHandler, ProgressReport, ProgressTracker};
pub use refresh_coordinator::{RefreshCoordinator, RefreshCoordinatorConfig};
