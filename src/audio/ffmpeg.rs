// FFmpeg 封装模块 - 转码接口

use crate::audio::process::run_with_deadline;
use crate::error::{AppError, AppResult};
use crate::utils::{hidden_command, resolve_tool_path, song_id_of};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// 流水线要求的采样率
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// 转码器：生成双声道 WAV 副本
pub trait Transcoder: Send + Sync {
    /// 在 `output_dir` 中生成符合要求的副本并返回其路径；源文件无法读取时返回 `AppError::Input`
    fn normalize_to_stereo(&self, input: &Path, output_dir: &Path) -> AppResult<PathBuf>;
}

/// 转码副本的文件名
pub fn stereo_copy_path(input: &Path, output_dir: &Path) -> PathBuf {
    output_dir.join(format!("{}_stereo.wav", song_id_of(input)))
}

pub struct FfmpegTranscoder {
    program: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: resolve_tool_path("ffmpeg"),
            timeout,
        }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn normalize_to_stereo(&self, input: &Path, output_dir: &Path) -> AppResult<PathBuf> {
        std::fs::create_dir_all(output_dir)?;
        let output_path = stereo_copy_path(input, output_dir);
        info!("[FFMPEG] 转码为双声道 WAV: {} -> {}", input.display(), output_path.display());

        let mut cmd = hidden_command(&self.program);
        cmd.args(["-y", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-vn", "-acodec", "pcm_s16le", "-ac", "2", "-ar"])
            .arg(TARGET_SAMPLE_RATE.to_string())
            .args(["-f", "wav"])
            .arg(&output_path);

        let output = run_with_deadline(cmd, "ffmpeg", self.timeout, |_| {}).map_err(|e| match e {
            AppError::Io(io) => AppError::Input(format!("ffmpeg 执行失败: {}", io)),
            other => other,
        })?;

        if !output.status.success() {
            error!("[FFMPEG] 转码失败: {}", output.error_summary());
            let _ = std::fs::remove_file(&output_path);
            return Err(AppError::Input(format!(
                "无法转码输入文件 {}: {}",
                input.display(),
                output.error_summary()
            )));
        }

        Ok(output_path)
    }
}
