// 任务调度器
//
// 固定数量的工作槽，严格按提交顺序放行排队任务。
// 锁顺序：先 state，再注册表。

use crate::config::AppConfig;
use crate::error::{AppError, AppResult, ErrorKind, JobError};
use crate::jobs::job::{Job, JobRequest, JobState};
use crate::jobs::progress::{ProgressEvent, ProgressObserver, ProgressReporter};
use crate::jobs::registry::JobRegistry;
use crate::pipeline::runner::{JobOutcome, PipelineRunner};
use crate::utils::{generate_id, song_id_of};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 取消请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 排队中的任务已被移除
    Removed,
    /// 运行中的任务已设置取消标志，将在下一阶段开始前停止
    Flagged,
    AlreadyFinished,
    NotFound,
}

struct SchedulerState {
    queue: VecDeque<String>,
    /// 运行中的任务及其取消标志
    running: HashMap<String, Arc<AtomicBool>>,
    max_workers: usize,
}

pub struct Scheduler {
    runner: Arc<PipelineRunner>,
    registry: Arc<JobRegistry>,
    reporter: Arc<ProgressReporter>,
    state: Mutex<SchedulerState>,
    /// 任务进入终止状态时通知 wait_for
    finished: Condvar,
    finished_lock: Mutex<()>,
}

/// 工作线程退出时释放槽位，panic 时同样生效
struct SlotGuard {
    scheduler: Arc<Scheduler>,
    job_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.state.lock().running.remove(&self.job_id);
        self.scheduler.try_admit();
    }
}

impl Scheduler {
    pub fn new(runner: Arc<PipelineRunner>, max_workers: usize) -> Arc<Self> {
        info!("[SCHEDULER] 初始化，工作槽数量: {}", max_workers.max(1));
        Arc::new(Self {
            runner,
            registry: Arc::new(JobRegistry::new()),
            reporter: Arc::new(ProgressReporter::new()),
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                running: HashMap::new(),
                max_workers: max_workers.max(1),
            }),
            finished: Condvar::new(),
            finished_lock: Mutex::new(()),
        })
    }

    pub fn from_config(runner: Arc<PipelineRunner>, config: &AppConfig) -> Arc<Self> {
        Self::new(runner, config.scheduler.max_workers)
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        self.reporter.subscribe(observer);
    }

    /// 提交任务，立即返回任务 ID；容量不足时任务保持排队，从不拒绝
    pub fn submit(
        self: &Arc<Self>,
        input: impl Into<PathBuf>,
        voice_model: Option<String>,
        device: impl Into<String>,
    ) -> String {
        self.submit_request(JobRequest::new(input, voice_model, device))
    }

    pub fn submit_request(self: &Arc<Self>, request: JobRequest) -> String {
        let job_id = generate_id();
        let song_id = song_id_of(&request.input_path);
        info!(
            "[SCHEDULER] 提交任务 job={} 输入={} 变声模型={:?} 设备={}",
            job_id,
            request.input_path.display(),
            request.voice_model,
            request.device
        );

        let job = Job::new(job_id.clone(), song_id, request);
        let message = job.status_message.clone();
        self.registry.insert(job);
        // 入队前发出 Queued 事件，保证观察者先看到 Queued 再看到 Running
        self.emit(&job_id, JobState::Queued, 0, &message);
        self.state.lock().queue.push_back(job_id.clone());

        self.try_admit();
        job_id
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.state.lock();

        // 结果已记录但槽位尚未释放的任务同样视为已结束
        if let Some(job) = self.registry.get(job_id) {
            if job.state.is_terminal() {
                return CancelOutcome::AlreadyFinished;
            }
        }

        if let Some(flag) = state.running.get(job_id) {
            flag.store(true, Ordering::SeqCst);
            info!("[SCHEDULER] 已请求取消运行中的任务 job={}", job_id);
            return CancelOutcome::Flagged;
        }

        if let Some(pos) = state.queue.iter().position(|id| id == job_id) {
            state.queue.remove(pos);
            self.registry.remove_queued(job_id);
            info!("[SCHEDULER] 已移除排队任务 job={}", job_id);
            return CancelOutcome::Removed;
        }

        match self.registry.get(job_id) {
            Some(_) => CancelOutcome::AlreadyFinished,
            None => CancelOutcome::NotFound,
        }
    }

    /// 非阻塞读取任务快照
    pub fn status(&self, job_id: &str) -> AppResult<Job> {
        self.registry
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("任务不存在: {}", job_id)))
    }

    pub fn list(&self) -> Vec<Job> {
        self.registry.list()
    }

    pub fn max_workers(&self) -> usize {
        self.state.lock().max_workers
    }

    /// 只影响之后的放行，不会中断运行中的任务
    pub fn set_max_workers(self: &Arc<Self>, max_workers: usize) {
        let max_workers = max_workers.max(1);
        {
            let mut state = self.state.lock();
            info!("[SCHEDULER] 工作槽数量 {} -> {}", state.max_workers, max_workers);
            state.max_workers = max_workers;
        }
        self.try_admit();
    }

    /// 阻塞等待任务进入终止状态；超时或任务不存在时返回 None
    pub fn wait_for(&self, job_id: &str, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.finished_lock.lock();
        loop {
            let job = self.registry.get(job_id)?;
            if job.state.is_terminal() {
                return Some(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // 分片等待，避免错过通知
            let slice = (deadline - now).min(Duration::from_millis(200));
            self.finished.wait_for(&mut guard, slice);
        }
    }

    /// 放行排队任务直到槽位用满
    fn try_admit(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.running.len() < state.max_workers {
                let Some(job_id) = state.queue.pop_front() else {
                    break;
                };
                let output_dir = self.runner.layout().job_dir(&job_id);
                if let Err(e) = self.registry.mark_running(&job_id, output_dir) {
                    warn!("[SCHEDULER] 无法放行任务 job={}: {}", job_id, e);
                    continue;
                }
                let cancel = Arc::new(AtomicBool::new(false));
                state.running.insert(job_id.clone(), Arc::clone(&cancel));
                admitted.push((job_id, cancel));
            }
        }

        for (job_id, cancel) in admitted {
            if let Some(job) = self.registry.get(&job_id) {
                self.emit(&job_id, JobState::Running, job.progress, &job.status_message);
            }
            self.spawn_worker(job_id, cancel);
        }
    }

    fn spawn_worker(self: &Arc<Self>, job_id: String, cancel: Arc<AtomicBool>) {
        let scheduler = Arc::clone(self);
        let name = format!("worker-{}", &job_id[..job_id.len().min(8)]);
        let id = job_id.clone();
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || scheduler.execute(id, cancel));

        if let Err(e) = spawned {
            error!("[SCHEDULER] 无法启动工作线程 job={}: {}", job_id, e);
            self.abandon_admitted(&job_id, format!("无法启动工作线程: {}", e));
        }
    }

    /// 已放行但没有工作线程接手的任务：记为失败并把槽位让给下一个排队任务
    fn abandon_admitted(self: &Arc<Self>, job_id: &str, message: String) {
        self.state.lock().running.remove(job_id);
        self.record_outcome(
            job_id,
            JobOutcome::Failed {
                error: JobError::new(ErrorKind::EngineError, message),
                diagnostics: Vec::new(),
                warnings: Vec::new(),
            },
        );
        self.try_admit();
    }

    fn execute(self: Arc<Self>, job_id: String, cancel: Arc<AtomicBool>) {
        let _slot = SlotGuard {
            scheduler: Arc::clone(&self),
            job_id: job_id.clone(),
        };
        let Some(job) = self.registry.get(&job_id) else {
            warn!("[SCHEDULER] 任务已不存在 job={}", job_id);
            return;
        };

        let progress = |percent: u8, message: &str| {
            if let Ok(recorded) = self.registry.update_progress(&job_id, percent, message) {
                self.emit(&job_id, JobState::Running, recorded, message);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.runner.run(&job, &cancel, &progress)
        }))
        .unwrap_or_else(|_| {
            error!("[SCHEDULER] 工作线程 panic job={}", job_id);
            JobOutcome::Failed {
                error: JobError::new(ErrorKind::EngineError, "流水线异常退出"),
                diagnostics: Vec::new(),
                warnings: Vec::new(),
            }
        });

        self.record_outcome(&job_id, outcome);
    }

    fn record_outcome(&self, job_id: &str, outcome: JobOutcome) {
        let recorded = match outcome {
            JobOutcome::Done { outputs, warnings } => self
                .registry
                .complete(job_id, outputs, warnings)
                .map(|_| JobState::Done),
            JobOutcome::Failed {
                error,
                diagnostics,
                warnings,
            } => self
                .registry
                .fail(job_id, error, diagnostics, warnings)
                .map(|_| JobState::Failed),
        };

        match recorded {
            Ok(state) => {
                if let Some(job) = self.registry.get(job_id) {
                    info!("[SCHEDULER] 任务结束 job={} 状态={}", job_id, state);
                    self.emit(job_id, state, job.progress, &job.status_message);
                }
            }
            Err(e) => error!("[SCHEDULER] 记录任务结果失败 job={}: {}", job_id, e),
        }

        let _guard = self.finished_lock.lock();
        self.finished.notify_all();
    }

    fn emit(&self, job_id: &str, state: JobState, percent: u8, message: &str) {
        self.reporter.emit(ProgressEvent {
            job_id: job_id.to_string(),
            state,
            percent,
            message: message.to_string(),
        });
    }
}
