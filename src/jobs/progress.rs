// 进度事件
//
// 流水线只产生类型化的事件，由任意数量的观察者消费（命令行输出、日志、上层 API）。

use crate::jobs::job::JobState;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub state: JobState,
    /// 建议性的进度位置，不代表实际耗时比例
    pub percent: u8,
    pub message: String,
}

/// 进度观察者
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// 把事件转发到 channel 的观察者
pub struct ChannelObserver {
    sender: Sender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        // 接收端已关闭时丢弃
        let _ = self.sender.send(event.clone());
    }
}

/// 观察者注册表
#[derive(Default)]
pub struct ProgressReporter {
    observers: RwLock<Vec<Arc<dyn ProgressObserver>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers.write().push(observer);
    }

    pub fn emit(&self, event: ProgressEvent) {
        debug!(
            "[PROGRESS] job={} state={} {}% {}",
            event.job_id, event.state, event.percent, event.message
        );
        // 先复制列表再回调，观察者内可以安全地再订阅
        let observers: Vec<Arc<dyn ProgressObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_progress(&event);
        }
    }
}
