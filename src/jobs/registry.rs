// 任务注册表 - 唯一的共享可变状态
//
// 所有写操作（状态迁移、进度、输出）都在同一把写锁内完成，读操作拿到的是一致的快照。

use crate::error::{AppError, AppResult, JobError};
use crate::jobs::job::{ArtifactRole, Job, JobState};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::warn;

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, Job>,
    /// 提交顺序
    order: Vec<String>,
}

/// 成功任务的输出
#[derive(Debug, Clone)]
pub struct JobOutputs {
    pub output_dir: PathBuf,
    pub artifacts: BTreeMap<ArtifactRole, PathBuf>,
    pub final_vocal: PathBuf,
}

#[derive(Default)]
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        let mut inner = self.inner.write();
        inner.order.push(job.id.clone());
        inner.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().jobs.get(job_id).cloned()
    }

    /// 按提交顺序返回所有任务
    pub fn list(&self) -> Vec<Job> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.inner.read().jobs.values().filter(|j| j.state == state).count()
    }

    /// 仅删除仍在排队的任务
    pub fn remove_queued(&self, job_id: &str) -> bool {
        let mut inner = self.inner.write();
        let queued = matches!(inner.jobs.get(job_id), Some(job) if job.state == JobState::Queued);
        if queued {
            inner.jobs.remove(job_id);
            inner.order.retain(|id| id != job_id);
        }
        queued
    }

    /// Queued → Running
    pub fn mark_running(&self, job_id: &str, output_dir: PathBuf) -> AppResult<()> {
        self.with_job(job_id, |job| {
            Self::check_transition(job, JobState::Running)?;
            job.state = JobState::Running;
            job.output_dir = Some(output_dir);
            job.started_at = Some(Utc::now());
            job.status_message = "准备处理...".to_string();
            Ok(())
        })
    }

    /// 更新进度，返回实际记录的值（不会小于之前的值）
    pub fn update_progress(&self, job_id: &str, percent: u8, message: &str) -> AppResult<u8> {
        self.with_job(job_id, |job| {
            if job.state != JobState::Running {
                return Err(AppError::InvalidArgument(format!(
                    "任务 {} 不在运行状态，忽略进度更新",
                    job_id
                )));
            }
            job.progress = job.progress.max(percent.min(100));
            job.status_message = message.to_string();
            Ok(job.progress)
        })
    }

    /// Running → Done，同时写入输出
    pub fn complete(&self, job_id: &str, outputs: JobOutputs, warnings: Vec<JobError>) -> AppResult<()> {
        self.with_job(job_id, |job| {
            Self::check_transition(job, JobState::Done)?;
            job.state = JobState::Done;
            job.progress = 100;
            job.status_message = "处理完成".to_string();
            job.output_dir = Some(outputs.output_dir);
            job.artifacts = outputs.artifacts;
            job.final_vocal = Some(outputs.final_vocal);
            job.warnings = warnings;
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Running → Failed
    pub fn fail(
        &self,
        job_id: &str,
        error: JobError,
        diagnostics: Vec<PathBuf>,
        warnings: Vec<JobError>,
    ) -> AppResult<()> {
        self.with_job(job_id, |job| {
            Self::check_transition(job, JobState::Failed)?;
            job.state = JobState::Failed;
            job.status_message = format!("处理失败: {}", error.message);
            job.error = Some(error);
            job.diagnostic_paths = diagnostics;
            job.warnings = warnings;
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    fn check_transition(job: &Job, next: JobState) -> AppResult<()> {
        if job.state.can_transition_to(next) {
            Ok(())
        } else {
            warn!("[REGISTRY] 非法状态迁移 {} -> {} (job={})", job.state, next, job.id);
            Err(AppError::InvalidArgument(format!(
                "非法状态迁移 {} -> {}",
                job.state, next
            )))
        }
    }

    fn with_job<T>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> AppResult<T>) -> AppResult<T> {
        let mut inner = self.inner.write();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::NotFound(format!("任务不存在: {}", job_id)))?;
        f(job)
    }
}
