// 错误处理模块

use thiserror::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("输入错误: {0}")]
    Input(String),

    #[error("引擎错误: {0}")]
    Engine(String),

    #[error("未找到模型: {0}")]
    ModelNotFound(String),

    #[error("阶段超时: {0}")]
    Timeout(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("配置错误: {0}")]
    Config(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),
}

impl AppError {
    /// 映射到任务记录上的错误分类
    ///
    /// `Io` 归为引擎错误：输入阶段的 IO 问题由调用方显式包装成 `Input`。
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Input(_) | AppError::NotFound(_) | AppError::InvalidArgument(_) => {
                ErrorKind::InputError
            }
            AppError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Io(_)
            | AppError::Json(_)
            | AppError::Engine(_)
            | AppError::Timeout(_)
            | AppError::Config(_) => ErrorKind::EngineError,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

// 实现 Serialize 以便直接输出到 JSON 状态
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// 任务级错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InputError,
    EngineError,
    ModelNotFound,
    OptionalStageError,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InputError => "InputError",
            ErrorKind::EngineError => "EngineError",
            ErrorKind::ModelNotFound => "ModelNotFound",
            ErrorKind::OptionalStageError => "OptionalStageError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// 记录在任务上的结构化错误（终止错误与警告共用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        err.to_job_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_counts_as_engine_error() {
        let err = AppError::Timeout("stage1".into());
        assert_eq!(err.kind(), ErrorKind::EngineError);
    }

    #[test]
    fn io_error_counts_as_engine_error() {
        let err = AppError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.kind(), ErrorKind::EngineError);
    }

    #[test]
    fn job_error_carries_display_message() {
        let err = AppError::Input("文件不存在".into());
        let job_err = JobError::from(&err);
        assert_eq!(job_err.kind, ErrorKind::InputError);
        assert!(job_err.message.contains("文件不存在"));
    }
}
