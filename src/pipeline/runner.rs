// 单个任务的流水线状态机
//
// Init → FormatNormalize → Base → Clean → DeReverb → [VoiceConversion] → Done
// 每个阶段开始前检查取消标志；引擎调用在独立线程中执行并受阶段超时约束。

use crate::audio::ffmpeg::Transcoder;
use crate::audio::normalize::FormatNormalizer;
use crate::audio::separator::{SeparationEngine, SeparationOptions};
use crate::audio::voice::{ConversionParams, VoiceConversionEngine};
use crate::config::{AppConfig, VoiceConfig};
use crate::error::{AppError, AppResult, ErrorKind, JobError};
use crate::jobs::job::{ArtifactRole, Job};
use crate::jobs::registry::JobOutputs;
use crate::models::ModelRegistry;
use crate::pipeline::fallback::select_best_vocal;
use crate::pipeline::layout::OutputLayout;
use crate::pipeline::stages::{
    separation_stages, voice_conversion_stage, InputSource, PipelineStep, StageDescriptor,
    PERCENT_DONE, PERCENT_NORMALIZE, PERCENT_SEPARATED, PERCENT_START,
};
use crate::utils::is_usable_file;
use crossbeam_channel::RecvTimeoutError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 流水线依赖的外部能力
#[derive(Clone)]
pub struct Engines {
    pub separation: Arc<dyn SeparationEngine>,
    pub voice: Arc<dyn VoiceConversionEngine>,
    pub transcoder: Arc<dyn Transcoder>,
    pub models: Arc<dyn ModelRegistry>,
}

/// 一次执行的结果
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done {
        outputs: JobOutputs,
        warnings: Vec<JobError>,
    },
    Failed {
        error: JobError,
        diagnostics: Vec<PathBuf>,
        warnings: Vec<JobError>,
    },
}

/// 单次执行的可变上下文
struct RunContext {
    job_id: String,
    song_id: String,
    input: PathBuf,
    voice_model: Option<String>,
    device: String,
    job_dir: PathBuf,
    normalized: Option<PathBuf>,
    produced: BTreeMap<ArtifactRole, PathBuf>,
    best_vocal: Option<PathBuf>,
    final_vocal: Option<PathBuf>,
    warnings: Vec<JobError>,
}

impl RunContext {
    fn warn(&mut self, kind: ErrorKind, message: String) {
        warn!("[PIPELINE] job={} 警告 {}: {}", self.job_id, kind, message);
        self.warnings.push(JobError::new(kind, message));
    }
}

/// 变声阶段结束时释放引擎状态
struct ReleaseGuard(Arc<dyn VoiceConversionEngine>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        debug!("[PIPELINE] 释放变声引擎状态");
        self.0.release();
    }
}

pub struct PipelineRunner {
    engines: Engines,
    normalizer: Arc<FormatNormalizer>,
    layout: OutputLayout,
    stages: Vec<StageDescriptor>,
    voice_stage: StageDescriptor,
    voice_config: VoiceConfig,
    stage_timeout: Duration,
    retain_failed_artifacts: bool,
}

impl PipelineRunner {
    pub fn new(engines: Engines, config: &AppConfig) -> Self {
        let normalizer = Arc::new(FormatNormalizer::new(Arc::clone(&engines.transcoder)));
        Self {
            engines,
            normalizer,
            layout: OutputLayout::new(
                config.output.output_root.clone(),
                config.separation.output_format.clone(),
            ),
            stages: separation_stages(&config.separation),
            voice_stage: voice_conversion_stage(),
            voice_config: config.voice.clone(),
            stage_timeout: config.scheduler.stage_timeout(),
            retain_failed_artifacts: config.output.retain_failed_artifacts,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// 执行任务直到终止状态；错误全部转成结构化结果，不会向外抛出
    pub fn run(&self, job: &Job, cancel: &AtomicBool, progress: &dyn Fn(u8, &str)) -> JobOutcome {
        let mut ctx = RunContext {
            job_id: job.id.clone(),
            song_id: job.song_id.clone(),
            input: job.input_path.clone(),
            voice_model: job.voice_model.clone(),
            device: job.device.clone(),
            job_dir: self.layout.job_dir(&job.id),
            normalized: None,
            produced: BTreeMap::new(),
            best_vocal: None,
            final_vocal: None,
            warnings: Vec::new(),
        };
        let with_voice = ctx.voice_model.is_some();

        info!("[PIPELINE] === 开始处理 === job={} 输入={}", ctx.job_id, ctx.input.display());

        let mut step = PipelineStep::Init;
        while step != PipelineStep::Done {
            if step.is_stage() && cancel.load(Ordering::SeqCst) {
                info!("[PIPELINE] job={} 在 {} 之前被取消", ctx.job_id, step);
                return self.fail(ctx, AppError::Cancelled);
            }

            let result = match step {
                PipelineStep::Init => self.init(&mut ctx, progress),
                PipelineStep::FormatNormalize => self.normalize(&mut ctx, progress),
                PipelineStep::Base | PipelineStep::Clean | PipelineStep::DeReverb => {
                    self.separate(step, &mut ctx, progress)
                }
                PipelineStep::VoiceConversion => {
                    self.convert_voice(&mut ctx, progress);
                    Ok(())
                }
                PipelineStep::Done => Ok(()),
            };
            if let Err(e) = result {
                return self.fail(ctx, e);
            }

            if step == PipelineStep::DeReverb {
                match select_best_vocal(&ctx.produced) {
                    Some((role, path)) => {
                        info!("[PIPELINE] job={} 最佳人声: {} ({})", ctx.job_id, role, path.display());
                        ctx.final_vocal = Some(path.clone());
                        ctx.best_vocal = Some(path);
                    }
                    None => {
                        return self.fail(ctx, AppError::Engine("没有可用的人声输出".to_string()));
                    }
                }
                progress(PERCENT_SEPARATED, "分离完成");
            }

            step = step.next(with_voice);
        }

        progress(PERCENT_DONE, "处理完成");
        self.done(ctx)
    }

    fn init(&self, ctx: &mut RunContext, progress: &dyn Fn(u8, &str)) -> AppResult<()> {
        progress(PERCENT_START, "开始处理...");
        if !ctx.input.is_file() {
            return Err(AppError::Input(format!("输入文件不存在: {}", ctx.input.display())));
        }
        std::fs::create_dir_all(&ctx.job_dir).map_err(|e| {
            AppError::Engine(format!("无法创建任务目录 {}: {}", ctx.job_dir.display(), e))
        })?;
        debug!("[PIPELINE] job={} 输出目录: {}", ctx.job_id, ctx.job_dir.display());
        Ok(())
    }

    fn normalize(&self, ctx: &mut RunContext, progress: &dyn Fn(u8, &str)) -> AppResult<()> {
        progress(PERCENT_NORMALIZE, "正在转换音频格式...");
        let normalizer = Arc::clone(&self.normalizer);
        let input = ctx.input.clone();
        let work_dir = ctx.job_dir.clone();
        let normalized = call_with_timeout("normalize", self.stage_timeout, move || {
            normalizer.normalize(&input, &work_dir)
        })?;
        if normalized.transcoded {
            info!("[PIPELINE] job={} 使用转码副本: {}", ctx.job_id, normalized.path.display());
        }
        ctx.normalized = Some(normalized.path);
        Ok(())
    }

    fn separate(
        &self,
        step: PipelineStep,
        ctx: &mut RunContext,
        progress: &dyn Fn(u8, &str),
    ) -> AppResult<()> {
        let stage = self
            .stages
            .iter()
            .find(|s| s.step == step)
            .ok_or_else(|| AppError::Config(format!("未定义的阶段: {}", step)))?;
        let secondary_role = stage
            .secondary
            .ok_or_else(|| AppError::Config(format!("分离阶段 {} 缺少次输出角色", step)))?;

        progress(stage.percent, stage.message);
        let input = resolve_input(ctx, stage.input)?;
        info!("[PIPELINE] job={} 阶段 {} 输入: {}", ctx.job_id, step, input.display());

        let options = SeparationOptions {
            output_dir: ctx.job_dir.clone(),
            output_stem: ctx.song_id.clone(),
            primary_suffix: stage.primary.suffix().to_string(),
            secondary_suffix: secondary_role.suffix().to_string(),
            output_format: self.layout.format().to_string(),
            invert_stems: stage.invert_stems,
            denoise: stage.denoise,
            device: ctx.device.clone(),
        };
        let engine = Arc::clone(&self.engines.separation);
        let model = stage.model.clone().unwrap_or_default();
        let label = step.to_string();
        let (primary, secondary) = call_with_timeout(&label, self.stage_timeout, move || {
            engine.separate(&input, &model, &options)
        })
        .map_err(|e| match e {
            AppError::Cancelled => AppError::Cancelled,
            other => AppError::Engine(format!("{} 阶段失败: {}", step, other)),
        })?;

        // 第一阶段的两路输出是后续所有回退的基础，缺失即失败
        if step == PipelineStep::Base && !(is_usable_file(&primary) && is_usable_file(&secondary)) {
            return Err(AppError::Engine(format!(
                "{} 阶段未生成人声/伴奏: {} / {}",
                step,
                primary.display(),
                secondary.display()
            )));
        }

        if is_usable_file(&primary) {
            ctx.produced.insert(stage.primary, primary);
        } else {
            ctx.warn(
                ErrorKind::EngineError,
                format!("{} 阶段没有生成可用的 {} 输出，后续使用回退人声", step, stage.primary),
            );
        }
        if is_usable_file(&secondary) {
            ctx.produced.insert(secondary_role, secondary);
        } else {
            debug!("[PIPELINE] job={} 阶段 {} 缺少次输出 {}", ctx.job_id, step, secondary_role);
        }

        if stage.input == InputSource::Original && !stage.retain_original {
            discard_transcoded_copy(ctx);
        }
        Ok(())
    }

    /// 变声失败不影响任务结果，只记录警告
    fn convert_voice(&self, ctx: &mut RunContext, progress: &dyn Fn(u8, &str)) {
        let Some(model_ref) = ctx.voice_model.clone() else {
            return;
        };
        progress(self.voice_stage.percent, self.voice_stage.message);

        let input = match resolve_input(ctx, self.voice_stage.input) {
            Ok(path) => path,
            Err(e) => {
                ctx.warn(ErrorKind::OptionalStageError, e.to_string());
                return;
            }
        };

        let model = match self.engines.models.resolve(&model_ref) {
            Ok(model) => model,
            Err(e) => {
                ctx.warn(ErrorKind::ModelNotFound, e.to_string());
                return;
            }
        };

        let output = self
            .layout
            .artifact_path(&ctx.job_id, &ctx.song_id, self.voice_stage.primary);
        let params = ConversionParams::from_config(&self.voice_config, &ctx.device);
        let engine = Arc::clone(&self.engines.voice);
        let target = output.clone();
        // 释放放在执行线程内：超时后被放弃的 convert 返回之前不会释放
        let result = call_with_timeout("voice-conversion", self.stage_timeout, move || {
            let _release = ReleaseGuard(Arc::clone(&engine));
            engine.convert(&input, &model, &target, &params)
        });

        match result {
            Ok(()) if is_usable_file(&output) => {
                info!("[PIPELINE] job={} 变声完成: {}", ctx.job_id, output.display());
                ctx.produced.insert(self.voice_stage.primary, output.clone());
                ctx.final_vocal = Some(output);
            }
            Ok(()) => ctx.warn(
                ErrorKind::OptionalStageError,
                format!("变声没有生成输出文件: {}，返回原声", output.display()),
            ),
            Err(e) => ctx.warn(
                ErrorKind::OptionalStageError,
                format!("变声失败，返回原声: {}", e),
            ),
        }
    }

    fn done(&self, mut ctx: RunContext) -> JobOutcome {
        let job_id = ctx.job_id.clone();
        ctx.produced.retain(|role, path| {
            let exists = path.is_file();
            if !exists {
                warn!("[PIPELINE] job={} 输出 {} 已不存在: {}", job_id, role, path.display());
            }
            exists
        });
        let final_vocal = ctx
            .final_vocal
            .or(ctx.best_vocal)
            .unwrap_or_else(|| ctx.job_dir.clone());
        info!(
            "[PIPELINE] === 处理完成 === job={} 最终人声={} 警告数={}",
            ctx.job_id,
            final_vocal.display(),
            ctx.warnings.len()
        );
        JobOutcome::Done {
            outputs: JobOutputs {
                output_dir: ctx.job_dir,
                artifacts: ctx.produced,
                final_vocal,
            },
            warnings: ctx.warnings,
        }
    }

    fn fail(&self, ctx: RunContext, err: AppError) -> JobOutcome {
        let error = err.to_job_error();
        error!("[PIPELINE] job={} 处理失败: {}", ctx.job_id, error);

        let diagnostics = if self.retain_failed_artifacts {
            ctx.produced
                .values()
                .chain(ctx.normalized.iter().filter(|p| p.starts_with(&ctx.job_dir)))
                .filter(|p| is_usable_file(p))
                .cloned()
                .collect()
        } else {
            remove_job_dir(&ctx.job_dir);
            Vec::new()
        };

        JobOutcome::Failed {
            error,
            diagnostics,
            warnings: ctx.warnings,
        }
    }
}

/// 按阶段的输入规则取路径；指定角色不可用时沿回退链取人声
fn resolve_input(ctx: &RunContext, source: InputSource) -> AppResult<PathBuf> {
    match source {
        InputSource::Original => ctx
            .normalized
            .clone()
            .ok_or_else(|| AppError::Engine("输入尚未规范化".to_string())),
        InputSource::Role(role) => match ctx.produced.get(&role).filter(|p| is_usable_file(p)) {
            Some(path) => Ok(path.clone()),
            None => select_best_vocal(&ctx.produced)
                .map(|(fallback, path)| {
                    warn!("[PIPELINE] job={} {} 不可用，改用 {}", ctx.job_id, role, fallback);
                    path
                })
                .ok_or_else(|| AppError::Engine(format!("缺少阶段输入 {}", role))),
        },
        InputSource::BestVocal => ctx
            .best_vocal
            .clone()
            .ok_or_else(|| AppError::Engine("尚未选出最佳人声".to_string())),
    }
}

/// 删除任务目录内的转码副本；原始输入从不删除
fn discard_transcoded_copy(ctx: &mut RunContext) {
    let Some(copy) = ctx.normalized.take() else {
        return;
    };
    if copy == ctx.input || !copy.starts_with(&ctx.job_dir) {
        ctx.normalized = Some(copy);
        return;
    }
    match std::fs::remove_file(&copy) {
        Ok(()) => debug!("[PIPELINE] job={} 已删除转码副本 {}", ctx.job_id, copy.display()),
        Err(e) => {
            warn!("[PIPELINE] job={} 删除转码副本失败 {}: {}", ctx.job_id, copy.display(), e);
            ctx.normalized = Some(copy);
        }
    }
}

fn remove_job_dir(job_dir: &Path) {
    if job_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(job_dir) {
            warn!("[PIPELINE] 删除失败任务目录失败 {}: {}", job_dir.display(), e);
        }
    }
}

/// 在独立线程中执行阻塞调用，超时返回 `AppError::Timeout`
///
/// 超时后调用线程不会被强制终止，只是不再等待它的结果。
pub fn call_with_timeout<T, F>(label: &str, timeout: Duration, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name(format!("stage-{}", label))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| AppError::Engine(format!("无法启动阶段线程 {}: {}", label, e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            error!("[PIPELINE] 阶段 {} 超过 {:?} 未返回", label, timeout);
            Err(AppError::Timeout(format!("{} 超过 {:?} 未返回", label, timeout)))
        }
        Err(RecvTimeoutError::Disconnected) => {
            Err(AppError::Engine(format!("阶段 {} 异常退出", label)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_turns_into_error() {
        let err = call_with_timeout("slow", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::EngineError);
    }

    #[test]
    fn panicking_call_becomes_engine_error() {
        let err = call_with_timeout::<(), _>("boom", Duration::from_secs(5), || panic!("engine crashed"))
            .unwrap_err();
        assert!(matches!(err, AppError::Engine(_)));
    }

    #[test]
    fn fast_call_returns_value() {
        let value = call_with_timeout("fast", Duration::from_secs(5), || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }
}
