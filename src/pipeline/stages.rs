// 流水线形状：固定的阶段描述

use crate::config::SeparationConfig;
use crate::jobs::job::ArtifactRole;
use std::fmt;

/// 状态机的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Init,
    FormatNormalize,
    /// 第一阶段：整曲 -> 原始人声 + 伴奏
    Base,
    /// 第二阶段：原始人声 -> 主唱 + 和声
    Clean,
    /// 第三阶段：主唱 -> 去混响人声 + 混响
    DeReverb,
    VoiceConversion,
    Done,
}

impl PipelineStep {
    /// 需要在进入前检查取消标志的步骤
    pub fn is_stage(&self) -> bool {
        !matches!(self, PipelineStep::Init | PipelineStep::Done)
    }

    pub fn next(&self, with_voice: bool) -> PipelineStep {
        match self {
            PipelineStep::Init => PipelineStep::FormatNormalize,
            PipelineStep::FormatNormalize => PipelineStep::Base,
            PipelineStep::Base => PipelineStep::Clean,
            PipelineStep::Clean => PipelineStep::DeReverb,
            PipelineStep::DeReverb if with_voice => PipelineStep::VoiceConversion,
            PipelineStep::DeReverb | PipelineStep::VoiceConversion | PipelineStep::Done => {
                PipelineStep::Done
            }
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::Init => "init",
            PipelineStep::FormatNormalize => "format-normalize",
            PipelineStep::Base => "base",
            PipelineStep::Clean => "clean",
            PipelineStep::DeReverb => "dereverb",
            PipelineStep::VoiceConversion => "voice-conversion",
            PipelineStep::Done => "done",
        };
        f.write_str(name)
    }
}

/// 阶段调用的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Separation,
    VoiceConversion,
}

/// 阶段输入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// 规范化后的原始音频
    Original,
    /// 之前阶段的某个输出
    Role(ArtifactRole),
    /// 回退链选出的最佳人声
    BestVocal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub step: PipelineStep,
    pub capability: Capability,
    pub input: InputSource,
    pub primary: ArtifactRole,
    pub secondary: Option<ArtifactRole>,
    /// 分离模型文件名；变声阶段使用任务自带的模型引用
    pub model: Option<String>,
    pub denoise: bool,
    pub retain_original: bool,
    /// 主输出取模型的反相轨
    pub invert_stems: bool,
    /// 进入阶段时上报的进度
    pub percent: u8,
    pub message: &'static str,
}

/// 进度检查点
pub const PERCENT_START: u8 = 0;
pub const PERCENT_NORMALIZE: u8 = 10;
pub const PERCENT_SEPARATED: u8 = 85;
pub const PERCENT_DONE: u8 = 100;

/// 三个必经的分离阶段
pub fn separation_stages(config: &SeparationConfig) -> Vec<StageDescriptor> {
    vec![
        StageDescriptor {
            step: PipelineStep::Base,
            capability: Capability::Separation,
            input: InputSource::Original,
            primary: ArtifactRole::Vocals,
            secondary: Some(ArtifactRole::Instrumental),
            model: Some(config.base_model.clone()),
            denoise: config.denoise,
            retain_original: config.keep_orig,
            invert_stems: false,
            percent: 20,
            message: "正在进行第一阶段分离（人声+伴奏）...",
        },
        StageDescriptor {
            step: PipelineStep::Clean,
            capability: Capability::Separation,
            input: InputSource::Role(ArtifactRole::Vocals),
            primary: ArtifactRole::Main,
            secondary: Some(ArtifactRole::Backup),
            model: Some(config.clean_model.clone()),
            denoise: config.denoise,
            retain_original: config.keep_orig,
            invert_stems: true,
            percent: 45,
            message: "正在进行第二阶段分离（主唱+和声）...",
        },
        StageDescriptor {
            step: PipelineStep::DeReverb,
            capability: Capability::Separation,
            input: InputSource::Role(ArtifactRole::Main),
            primary: ArtifactRole::DeReverb,
            secondary: Some(ArtifactRole::Reverb),
            model: Some(config.dereverb_model.clone()),
            denoise: config.denoise,
            retain_original: config.keep_orig,
            invert_stems: true,
            percent: 70,
            message: "正在进行第三阶段分离（去混响）...",
        },
    ]
}

/// 可选的变声阶段
pub fn voice_conversion_stage() -> StageDescriptor {
    StageDescriptor {
        step: PipelineStep::VoiceConversion,
        capability: Capability::VoiceConversion,
        input: InputSource::BestVocal,
        primary: ArtifactRole::Converted,
        secondary: None,
        model: None,
        denoise: false,
        retain_original: true,
        invert_stems: false,
        percent: 90,
        message: "正在进行变声...",
    }
}
