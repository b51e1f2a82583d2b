//! 上传进度跟踪
//!
//! 并发分片的进度按分片累加后再上报，保证上报值单调不减，
//! 且只有提交成功后才会上报 completed == total

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 进度报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReport {
    pub total_bytes: u64,
    pub completed_bytes: u64,
}

impl ProgressReport {
    /// 进度百分比
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.completed_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// 进度回调，在调用方选择的上下文中执行
pub type ProgressHandler = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// 创建一个把进度转发到通道的回调，由调用方在自己的任务中消费
pub fn progress_channel() -> (ProgressHandler, mpsc::UnboundedReceiver<ProgressReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: ProgressHandler = Arc::new(move |report| {
        // 接收端关闭后忽略
        let _ = tx.send(report);
    });
    (handler, rx)
}

#[derive(Debug, Default)]
struct TrackerState {
    /// 分片号 -> 该分片已发送字节
    parts: BTreeMap<u32, u64>,
    /// 顺序上传已推进到的绝对偏移
    floor: u64,
    /// 上次上报值
    reported: u64,
    finished: bool,
}

/// 单次上传的进度跟踪器
pub struct ProgressTracker {
    total: u64,
    handler: Option<ProgressHandler>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total: u64, handler: Option<ProgressHandler>) -> Self {
        Self {
            total,
            handler,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 更新某分片已发送字节数
    pub fn part_progress(&self, part_number: u32, sent: u64) {
        let mut state = self.state.lock();
        let entry = state.parts.entry(part_number).or_insert(0);
        *entry = (*entry).max(sent);
        let accumulated: u64 = state.parts.values().sum();
        let value = accumulated.max(state.floor);
        self.report_locked(&mut state, value);
    }

    /// 顺序上传时推进到绝对偏移（含服务端确认的游标）
    pub fn advance_to(&self, offset: u64) {
        let mut state = self.state.lock();
        state.floor = state.floor.max(offset);
        let value = state.floor;
        self.report_locked(&mut state, value);
    }

    /// 提交成功后上报完成
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        state.reported = self.total;
        if let Some(handler) = &self.handler {
            handler(ProgressReport {
                total_bytes: self.total,
                completed_bytes: self.total,
            });
        }
    }

    /// 最近一次上报值
    pub fn completed(&self) -> u64 {
        self.state.lock().reported
    }

    fn report_locked(&self, state: &mut TrackerState, value: u64) {
        if state.finished {
            return;
        }
        // 提交前最多到 total - 1
        let cap = self.total.saturating_sub(1);
        let value = value.min(cap);
        if value <= state.reported {
            return;
        }
        state.reported = value;
        if let Some(handler) = &self.handler {
            handler(ProgressReport {
                total_bytes: self.total,
                completed_bytes: value,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_tracker(total: u64) -> (ProgressTracker, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ProgressHandler = Arc::new(move |r: ProgressReport| {
            sink.lock().push(r.completed_bytes);
        });
        (ProgressTracker::new(total, Some(handler)), seen)
    }

    #[test]
    fn test_progress_is_monotonic_across_parts() {
        let (tracker, seen) = collecting_tracker(300);
        tracker.part_progress(2, 50);
        tracker.part_progress(1, 80);
        // 同一分片回退的值不应导致进度回退
        tracker.part_progress(2, 10);
        tracker.part_progress(3, 100);

        let values = seen.lock().clone();
        assert_eq!(values, vec![50, 130, 230]);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_total_only_after_finish() {
        let (tracker, seen) = collecting_tracker(100);
        tracker.part_progress(1, 100);
        assert_eq!(tracker.completed(), 99);
        tracker.finish();
        tracker.finish();
        assert_eq!(seen.lock().clone(), vec![99, 100]);
    }

    #[test]
    fn test_zero_length_reports_once_on_finish() {
        let (tracker, seen) = collecting_tracker(0);
        tracker.part_progress(1, 0);
        tracker.finish();
        assert_eq!(seen.lock().clone(), vec![0]);
    }

    #[test]
    fn test_advance_never_regresses() {
        let (tracker, seen) = collecting_tracker(1000);
        tracker.advance_to(400);
        tracker.advance_to(200);
        tracker.part_progress(1, 300);
        assert_eq!(seen.lock().clone(), vec![400]);
    }

    #[tokio::test]
    async fn test_progress_channel_delivers_reports() {
        let (handler, mut rx) = progress_channel();
        let tracker = ProgressTracker::new(10, Some(handler));
        tracker.part_progress(1, 5);
        tracker.finish();
        assert_eq!(rx.recv().await.unwrap().completed_bytes, 5);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.completed_bytes, 10);
        assert_eq!(last.percent(), 100.0);
    }
}
