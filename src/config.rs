// 配置管理模块

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use crate::error::{AppError, AppResult};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::info;

static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();

/// 日志级别
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// 转换为 tracing 过滤器字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 同时运行的任务数（工作槽数量）
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 单个阶段的超时时间 (秒)
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    num_cpus::get().clamp(1, 2)
}

fn default_stage_timeout_secs() -> u64 {
    30 * 60
}

impl SchedulerConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

/// 人声分离配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationConfig {
    /// MDX 模型目录
    pub models_dir: PathBuf,
    /// 输出格式
    pub output_format: String,
    /// 第一阶段：整曲 -> 人声 + 伴奏
    pub base_model: String,
    /// 第二阶段：人声 -> 主唱 + 和声
    pub clean_model: String,
    /// 第三阶段：主唱 -> 去混响 + 混响
    pub dereverb_model: String,
    #[serde(default = "default_true")]
    pub denoise: bool,
    #[serde(default = "default_true")]
    pub keep_orig: bool,
    /// audio-separator 可执行文件
    #[serde(default = "default_separator_program")]
    pub separator_program: String,
}

fn default_true() -> bool {
    true
}

fn default_separator_program() -> String {
    "audio-separator".to_string()
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("mdxnet_models"),
            output_format: "wav".to_string(),
            base_model: "UVR-MDX-NET-Voc_FT.onnx".to_string(),
            clean_model: "UVR_MDXNET_KARA_2.onnx".to_string(),
            dereverb_model: "Reverb_HQ_By_FoxJoy.onnx".to_string(),
            denoise: true,
            keep_orig: true,
            separator_program: default_separator_program(),
        }
    }
}

/// 变声配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// 变声模型根目录，每个模型一个子目录
    pub models_dir: PathBuf,
    /// 变声推理可执行文件
    pub program: String,
    pub pitch_change: i32,
    pub f0_method: String,
    pub index_rate: f32,
    pub filter_radius: u32,
    pub rms_mix_rate: f32,
    pub protect: f32,
    pub crepe_hop_length: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("rvc_models"),
            program: "rvc-infer".to_string(),
            pitch_change: 0,
            f0_method: "rmvpe".to_string(),
            index_rate: 0.5,
            filter_radius: 3,
            rms_mix_rate: 0.25,
            protect: 0.33,
            crepe_hop_length: 128,
        }
    }
}

/// 输出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// 所有任务目录的根
    pub output_root: PathBuf,
    /// 失败任务是否保留中间文件
    #[serde(default = "default_true")]
    pub retain_failed_artifacts: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("song_output"),
            retain_failed_artifacts: true,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub separation: SeparationConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// 日志级别
    #[serde(default)]
    pub log_level: LogLevel,
}

impl AppConfig {
    /// 以数据目录为基准解析相对路径
    pub fn rooted_at(mut self, data_dir: &Path) -> Self {
        let root = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = data_dir.join(&*p);
            }
        };
        root(&mut self.separation.models_dir);
        root(&mut self.voice.models_dir);
        root(&mut self.output.output_root);
        self
    }
}

/// 读取配置文件；不存在时写入默认配置，解析失败时回退默认值
pub fn load_config(config_path: &Path) -> AppResult<AppConfig> {
    if config_path.exists() {
        let content = fs::read_to_string(config_path)?;
        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("[CONFIG] 配置文件 JSON 解析失败: {}，使用默认配置", e);
            AppConfig::default()
        }))
    } else {
        let config = AppConfig::default();
        save_config(config_path, &config)?;
        Ok(config)
    }
}

pub fn save_config(config_path: &Path, config: &AppConfig) -> AppResult<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, content)?;
    Ok(())
}

/// 初始化全局配置
pub fn init_config(config_path: &Path) -> AppResult<()> {
    let config = load_config(config_path)?;
    info!("[CONFIG] 配置已加载: {}", config_path.display());

    CONFIG.set(RwLock::new(config))
        .map_err(|_| AppError::Config("配置已初始化".to_string()))?;

    Ok(())
}

/// 获取配置
pub fn get_config() -> AppConfig {
    CONFIG.get()
        .map(|c| c.read().clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.separation.output_format, "wav");
        assert!(config.output.retain_failed_artifacts);
        assert!(config.scheduler.max_workers >= 1);
    }

    #[test]
    fn broken_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "scheduler": { "max_workers": 4 }, "log_level": "debug" }"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.scheduler.max_workers, 4);
        assert_eq!(config.scheduler.stage_timeout_secs, 1800);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.voice.f0_method, "rmvpe");
    }

    #[test]
    fn relative_paths_are_rooted_at_data_dir() {
        let config = AppConfig::default().rooted_at(Path::new("/data"));
        assert_eq!(config.output.output_root, PathBuf::from("/data/song_output"));
        assert_eq!(config.voice.models_dir, PathBuf::from("/data/rvc_models"));
    }
}
