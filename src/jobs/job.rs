// 任务数据模型

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// 任务状态：只允许 Queued → Running → {Done, Failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::Done)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Done => "Done",
            JobState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// 输出文件角色，决定文件名后缀
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArtifactRole {
    /// 第一阶段的原始人声
    Vocals,
    Instrumental,
    Main,
    Backup,
    DeReverb,
    Reverb,
    Converted,
}

impl ArtifactRole {
    pub const ALL: [ArtifactRole; 7] = [
        ArtifactRole::Vocals,
        ArtifactRole::Instrumental,
        ArtifactRole::Main,
        ArtifactRole::Backup,
        ArtifactRole::DeReverb,
        ArtifactRole::Reverb,
        ArtifactRole::Converted,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            ArtifactRole::Vocals => "Vocals",
            ArtifactRole::Instrumental => "Instrumental",
            ArtifactRole::Main => "Main",
            ArtifactRole::Backup => "Backup",
            ArtifactRole::DeReverb => "DeReverb",
            ArtifactRole::Reverb => "Reverb",
            ArtifactRole::Converted => "Converted",
        }
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// 提交参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub input_path: PathBuf,
    pub voice_model: Option<String>,
    pub device: String,
}

impl JobRequest {
    pub fn new(input_path: impl Into<PathBuf>, voice_model: Option<String>, device: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            voice_model: voice_model.filter(|m| !m.trim().is_empty()),
            device: device.into(),
        }
    }
}

/// 任务快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// 分组键：输入文件名去掉扩展名
    pub song_id: String,
    pub input_path: PathBuf,
    pub voice_model: Option<String>,
    pub device: String,
    pub state: JobState,
    /// 0-100，任务内单调不减
    pub progress: u8,
    pub status_message: String,
    /// 任务独占的输出目录
    pub output_dir: Option<PathBuf>,
    /// 仅在 Done 时填充
    pub artifacts: BTreeMap<ArtifactRole, PathBuf>,
    /// 最终人声（变声结果或回退的最佳人声），仅在 Done 时填充
    pub final_vocal: Option<PathBuf>,
    /// 失败任务保留的诊断文件
    pub diagnostic_paths: Vec<PathBuf>,
    pub error: Option<JobError>,
    pub warnings: Vec<JobError>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, song_id: String, request: JobRequest) -> Self {
        Self {
            id,
            song_id,
            input_path: request.input_path,
            voice_model: request.voice_model,
            device: request.device,
            state: JobState::Queued,
            progress: 0,
            status_message: "等待处理...".to_string(),
            output_dir: None,
            artifacts: BTreeMap::new(),
            final_vocal: None,
            diagnostic_paths: Vec::new(),
            error: None,
            warnings: Vec::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// 最终伴奏
    pub fn instrumental(&self) -> Option<&PathBuf> {
        self.artifacts.get(&ArtifactRole::Instrumental)
    }
}
