// 人声分离模块 - 分离引擎接口与 audio-separator 实现

use crate::audio::process::run_with_deadline;
use crate::config::SeparationConfig;
use crate::error::{AppError, AppResult};
use crate::utils::{hidden_command, is_usable_file, resolve_tool_path};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// 静态正则表达式，避免重复编译
// tqdm 进度输出形如 "100%|██████████| 100/100 [00:10<00:00, 10.00it/s]"
static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})%").unwrap());

/// 单次分离调用的参数
#[derive(Debug, Clone)]
pub struct SeparationOptions {
    /// 输出目录（任务目录）
    pub output_dir: PathBuf,
    /// 输出文件名前缀（歌曲 ID）
    pub output_stem: String,
    /// 主输出角色后缀，如 "Vocals"
    pub primary_suffix: String,
    /// 次输出角色后缀，如 "Instrumental"
    pub secondary_suffix: String,
    pub output_format: String,
    /// 主输出对应模型的反相轨（伴奏/无混响）而不是模型主轨
    pub invert_stems: bool,
    pub denoise: bool,
    /// 设备提示，如 "cuda" / "cpu"
    pub device: String,
}

impl SeparationOptions {
    pub fn primary_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_{}.{}", self.output_stem, self.primary_suffix, self.output_format))
    }

    pub fn secondary_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_{}.{}", self.output_stem, self.secondary_suffix, self.output_format))
    }
}

/// 分离引擎：把一个音频拆成互补的两路
pub trait SeparationEngine: Send + Sync {
    /// 返回 (主输出, 次输出) 路径
    fn separate(
        &self,
        input: &Path,
        model: &str,
        options: &SeparationOptions,
    ) -> AppResult<(PathBuf, PathBuf)>;
}

/// 调用 audio-separator 命令行的分离引擎
pub struct AudioSeparatorCli {
    program: String,
    models_dir: PathBuf,
    timeout: Duration,
}

impl AudioSeparatorCli {
    pub fn new(config: &SeparationConfig, timeout: Duration) -> Self {
        Self {
            program: resolve_tool_path(&config.separator_program),
            models_dir: config.models_dir.clone(),
            timeout,
        }
    }

    /// 在临时输出目录里区分模型主轨与反相轨
    fn classify_outputs(scratch_dir: &Path, input_stem: &str) -> AppResult<(PathBuf, PathBuf)> {
        let mut found: Vec<PathBuf> = fs::read_dir(scratch_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| is_usable_file(p))
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().contains(input_stem))
                    .unwrap_or(false)
            })
            .collect();
        found.sort();
        info!("[SEPARATOR] 输出目录中的文件: {:?}", found);

        let is_inverted = |p: &Path| {
            p.file_name()
                .map(|n| is_inverted_tag(&stem_tag(&n.to_string_lossy(), input_stem)))
                .unwrap_or(false)
        };

        let inverted = found.iter().find(|p| is_inverted(p)).cloned();
        let model_stem = found.iter().find(|p| !is_inverted(p)).cloned();
        match (model_stem, inverted) {
            (Some(stem), Some(inv)) => Ok((stem, inv)),
            _ => Err(AppError::Engine(format!(
                "audio-separator 输出文件不完整，目录中的文件: {:?}",
                found
            ))),
        }
    }
}

impl SeparationEngine for AudioSeparatorCli {
    fn separate(
        &self,
        input: &Path,
        model: &str,
        options: &SeparationOptions,
    ) -> AppResult<(PathBuf, PathBuf)> {
        info!("[SEPARATOR] 开始分离: {} (模型 {})", input.display(), model);

        if !input.is_file() {
            return Err(AppError::Engine(format!("输入音频不存在: {}", input.display())));
        }
        let model_path = self.models_dir.join(model);
        if !model_path.is_file() {
            return Err(AppError::Engine(format!("分离模型不存在: {}", model_path.display())));
        }

        // 每次调用使用独立的临时目录，避免与同一任务内其他阶段的输出混淆
        let scratch_dir = options
            .output_dir
            .join(format!(".sep_{}_{}", options.primary_suffix, options.secondary_suffix));
        if scratch_dir.exists() {
            fs::remove_dir_all(&scratch_dir)?;
        }
        fs::create_dir_all(&scratch_dir)?;

        let mut cmd = hidden_command(&self.program);
        cmd.arg(input)
            .arg("--model_filename")
            .arg(model)
            .arg("--model_file_dir")
            .arg(&self.models_dir)
            .arg("--output_dir")
            .arg(&scratch_dir)
            .arg("--output_format")
            .arg(&options.output_format);
        if options.denoise {
            cmd.arg("--mdx_enable_denoise");
        }

        // CPU 模式：CUDA_VISIBLE_DEVICES="-1" 才能真正禁用 GPU
        if options.device.eq_ignore_ascii_case("cpu") {
            cmd.env("CUDA_VISIBLE_DEVICES", "-1");
        }

        let output = run_with_deadline(cmd, "audio-separator", self.timeout, |line| {
            if let Some(percent) = parse_progress(line) {
                debug!("[SEPARATOR] 分离进度: {:.0}%", percent * 100.0);
            }
        })
        .map_err(|e| match e {
            AppError::Io(io) => AppError::Engine(format!("启动 audio-separator 失败: {}", io)),
            other => other,
        })?;

        if !output.status.success() {
            error!("[SEPARATOR] audio-separator 处理失败，退出码: {:?}", output.status.code());
            return Err(AppError::Engine(format!(
                "audio-separator 处理失败: {}",
                output.error_summary()
            )));
        }

        let input_stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let (model_stem, inverted) = Self::classify_outputs(&scratch_dir, &input_stem)?;
        let (primary_src, secondary_src) = if options.invert_stems {
            (inverted, model_stem)
        } else {
            (model_stem, inverted)
        };

        // 重命名为固定的角色文件名
        let primary = options.primary_path();
        let secondary = options.secondary_path();
        fs::rename(&primary_src, &primary)?;
        fs::rename(&secondary_src, &secondary)?;
        if let Err(e) = fs::remove_dir_all(&scratch_dir) {
            warn!("[SEPARATOR] 清理临时目录失败 {}: {}", scratch_dir.display(), e);
        }

        info!("[SEPARATOR] 分离完成: {} / {}", primary.display(), secondary.display());
        Ok((primary, secondary))
    }
}

/// 去掉输入文件名前缀后的轨道标记，如 `_(Vocals)_UVR_MDXNET_KARA_2`
///
/// 输入名本身可能带括号（`Song (No Copyright)`），只能在前缀之后判断。
fn stem_tag(file_name: &str, input_stem: &str) -> String {
    file_name
        .strip_prefix(input_stem)
        .unwrap_or(file_name)
        .to_lowercase()
}

/// 模型的反相轨：伴奏、`(No xxx)` 或 no_vocal
fn is_inverted_tag(tag: &str) -> bool {
    tag.contains("(instrumental)") || tag.contains("(no ") || tag.contains("no_vocal")
}

/// 解析进度输出，返回 0.0-1.0
pub fn parse_progress(line: &str) -> Option<f32> {
    PROGRESS_REGEX
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .filter(|p| *p <= 100.0)
        .map(|p| p / 100.0)
}
