// 变声模块 - 变声引擎接口与外部推理进程实现

use crate::audio::process::run_with_deadline;
use crate::config::VoiceConfig;
use crate::error::{AppError, AppResult};
use crate::models::ResolvedModel;
use crate::utils::{hidden_command, is_usable_file, resolve_tool_path};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

/// 变声推理参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub pitch_change: i32,
    pub f0_method: String,
    pub index_rate: f32,
    pub filter_radius: u32,
    pub rms_mix_rate: f32,
    pub protect: f32,
    pub crepe_hop_length: u32,
    pub device: String,
    pub is_half: bool,
}

impl ConversionParams {
    /// 半精度只在 CUDA 设备上启用
    pub fn from_config(config: &VoiceConfig, device: &str) -> Self {
        let device = normalize_device(device);
        let is_half = device.starts_with("cuda");
        Self {
            pitch_change: config.pitch_change,
            f0_method: config.f0_method.clone(),
            index_rate: config.index_rate,
            filter_radius: config.filter_radius,
            rms_mix_rate: config.rms_mix_rate,
            protect: config.protect,
            crepe_hop_length: config.crepe_hop_length,
            device,
            is_half,
        }
    }
}

/// "cuda" -> "cuda:0"，其余原样小写
fn normalize_device(device: &str) -> String {
    let device = device.trim().to_ascii_lowercase();
    if device == "cuda" || device == "gpu" {
        "cuda:0".to_string()
    } else if device.is_empty() {
        "cpu".to_string()
    } else {
        device
    }
}

/// 变声引擎
pub trait VoiceConversionEngine: Send + Sync {
    fn convert(
        &self,
        input_vocal: &Path,
        model: &ResolvedModel,
        output: &Path,
        params: &ConversionParams,
    ) -> AppResult<()>;

    /// 释放为变声加载的模型状态
    ///
    /// 在同一线程上紧接着 `convert` 返回（或 panic）之后调用，不会与 `convert` 并发。
    /// 阶段超时时，这次调用推迟到被放弃的 `convert` 真正返回之后。
    fn release(&self) {}
}

/// 调用外部变声推理程序；每次调用一个独立进程，进程退出即释放显存
pub struct RvcProcessEngine {
    program: String,
    timeout: Duration,
}

impl RvcProcessEngine {
    pub fn new(config: &VoiceConfig, timeout: Duration) -> Self {
        Self {
            program: resolve_tool_path(&config.program),
            timeout,
        }
    }
}

impl VoiceConversionEngine for RvcProcessEngine {
    fn convert(
        &self,
        input_vocal: &Path,
        model: &ResolvedModel,
        output: &Path,
        params: &ConversionParams,
    ) -> AppResult<()> {
        info!("[VOICE] 开始变声: {} (模型 {})", input_vocal.display(), model.name);

        let mut cmd = hidden_command(&self.program);
        cmd.arg("--model")
            .arg(&model.primary_file)
            .arg("--input")
            .arg(input_vocal)
            .arg("--output")
            .arg(output)
            .arg("--pitch")
            .arg(params.pitch_change.to_string())
            .arg("--f0-method")
            .arg(&params.f0_method)
            .arg("--index-rate")
            .arg(params.index_rate.to_string())
            .arg("--filter-radius")
            .arg(params.filter_radius.to_string())
            .arg("--rms-mix-rate")
            .arg(params.rms_mix_rate.to_string())
            .arg("--protect")
            .arg(params.protect.to_string())
            .arg("--crepe-hop-length")
            .arg(params.crepe_hop_length.to_string())
            .arg("--device")
            .arg(&params.device);
        if let Some(index) = &model.aux_index_file {
            cmd.arg("--index").arg(index);
        }
        if params.is_half {
            cmd.arg("--half");
        }

        let result = run_with_deadline(cmd, "rvc-infer", self.timeout, |_| {}).map_err(|e| match e {
            AppError::Io(io) => AppError::Engine(format!("启动变声程序失败: {}", io)),
            other => other,
        })?;

        if !result.status.success() {
            error!("[VOICE] 变声失败，退出码: {:?}", result.status.code());
            return Err(AppError::Engine(format!("变声失败: {}", result.error_summary())));
        }
        if !is_usable_file(output) {
            return Err(AppError::Engine(format!("变声输出为空: {}", output.display())));
        }

        info!("[VOICE] 变声完成: {}", output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_only_on_cuda() {
        let config = VoiceConfig::default();
        let gpu = ConversionParams::from_config(&config, "cuda");
        assert_eq!(gpu.device, "cuda:0");
        assert!(gpu.is_half);

        let cpu = ConversionParams::from_config(&config, "CPU");
        assert_eq!(cpu.device, "cpu");
        assert!(!cpu.is_half);
    }

    #[test]
    fn params_copy_config_defaults() {
        let params = ConversionParams::from_config(&VoiceConfig::default(), "cuda:1");
        assert_eq!(params.f0_method, "rmvpe");
        assert_eq!(params.crepe_hop_length, 128);
        assert_eq!(params.device, "cuda:1");
    }
}
