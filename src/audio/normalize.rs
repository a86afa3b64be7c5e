// 输入格式规范化
//
// 保证进入第一阶段的是双声道、固定采样率的 WAV。已经符合要求的文件原样通过，
// 不会调用转码器，因此对同一文件重复执行不会重复转码。

use crate::audio::ffmpeg::{stereo_copy_path, Transcoder, TARGET_SAMPLE_RATE};
use crate::error::{AppError, AppResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// WAV 头信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavProbe {
    pub channels: u16,
    pub sample_rate: u32,
}

/// 读取 WAV 头；非 WAV 或损坏时返回 None
pub fn probe_wav(path: &Path) -> Option<WavProbe> {
    let is_wav_ext = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if !is_wav_ext {
        return None;
    }
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    Some(WavProbe {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

pub fn is_conforming(path: &Path) -> bool {
    matches!(
        probe_wav(path),
        Some(WavProbe { channels: 2, sample_rate }) if sample_rate == TARGET_SAMPLE_RATE
    )
}

/// 规范化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedInput {
    pub path: PathBuf,
    /// 是否生成了转码副本
    pub transcoded: bool,
}

pub struct FormatNormalizer {
    transcoder: Arc<dyn Transcoder>,
}

impl FormatNormalizer {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }

    /// 返回可以直接送入第一阶段的路径
    pub fn normalize(&self, input: &Path, work_dir: &Path) -> AppResult<NormalizedInput> {
        if !input.is_file() {
            return Err(AppError::Input(format!("输入文件不存在: {}", input.display())));
        }
        std::fs::File::open(input)
            .map_err(|e| AppError::Input(format!("无法读取输入文件 {}: {}", input.display(), e)))?;

        if is_conforming(input) {
            debug!("[NORMALIZE] 输入已是双声道 WAV，直接使用: {}", input.display());
            return Ok(NormalizedInput {
                path: input.to_path_buf(),
                transcoded: false,
            });
        }

        // 重试时复用已经生成的合格副本
        let existing = stereo_copy_path(input, work_dir);
        if is_conforming(&existing) {
            debug!("[NORMALIZE] 复用已有转码副本: {}", existing.display());
            return Ok(NormalizedInput {
                path: existing,
                transcoded: false,
            });
        }

        info!("[NORMALIZE] 输入需要转码: {}", input.display());
        let converted = self.transcoder.normalize_to_stereo(input, work_dir)?;
        if !is_conforming(&converted) {
            return Err(AppError::Input(format!(
                "转码结果不是双声道 {}Hz WAV: {}",
                TARGET_SAMPLE_RATE,
                converted.display()
            )));
        }

        Ok(NormalizedInput {
            path: converted,
            transcoded: true,
        })
    }
}
