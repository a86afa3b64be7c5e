// 集成测试共用的桩引擎与夹具

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vocalsplit::audio::ffmpeg::{stereo_copy_path, Transcoder};
use vocalsplit::audio::separator::{SeparationEngine, SeparationOptions};
use vocalsplit::audio::voice::{ConversionParams, VoiceConversionEngine};
use vocalsplit::jobs::{ChannelObserver, ProgressEvent};
use vocalsplit::{
    AppConfig, AppError, AppResult, Engines, FsModelRegistry, Job, PipelineRunner, ResolvedModel,
    Scheduler,
};

pub fn write_wav(path: &Path, channels: u16, sample_rate: u32) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..(128 * channels as i32) {
        writer.write_sample((i % 100) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// 分离桩：按主输出后缀决定写哪些文件
#[derive(Default)]
pub struct StubSeparator {
    /// 这些阶段（按主输出后缀）不写主输出
    pub skip_primary: HashSet<&'static str>,
    /// 这些阶段直接返回错误
    pub fail: HashSet<&'static str>,
    /// 每次调用的阻塞时间
    pub delay: Duration,
    pub calls: Mutex<Vec<(String, PathBuf)>>,
}

impl StubSeparator {
    pub fn skipping(stages: &[&'static str]) -> Self {
        Self {
            skip_primary: stages.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn failing(stage: &'static str) -> Self {
        Self {
            fail: [stage].into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl SeparationEngine for StubSeparator {
    fn separate(
        &self,
        input: &Path,
        _model: &str,
        options: &SeparationOptions,
    ) -> AppResult<(PathBuf, PathBuf)> {
        let stage = options.primary_suffix.as_str();
        self.calls.lock().push((stage.to_string(), input.to_path_buf()));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail.contains(stage) {
            return Err(AppError::Engine(format!("stub failure in {}", stage)));
        }
        if !self.skip_primary.contains(stage) {
            std::fs::write(options.primary_path(), b"primary")?;
        }
        std::fs::write(options.secondary_path(), b"secondary")?;
        Ok((options.primary_path(), options.secondary_path()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceMode {
    Succeed,
    Fail,
    /// 返回成功但没有写出文件
    Silent,
    /// 阻塞一段时间后成功
    Slow(Duration),
}

pub struct StubVoice {
    pub mode: VoiceMode,
    pub converts: AtomicUsize,
    pub releases: AtomicUsize,
    pub last_input: Mutex<Option<PathBuf>>,
    in_convert: AtomicBool,
    /// release 是否在 convert 尚未返回时被调用过
    pub released_during_convert: AtomicBool,
}

impl StubVoice {
    pub fn new(mode: VoiceMode) -> Self {
        Self {
            mode,
            converts: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            last_input: Mutex::new(None),
            in_convert: AtomicBool::new(false),
            released_during_convert: AtomicBool::new(false),
        }
    }
}

impl VoiceConversionEngine for StubVoice {
    fn convert(
        &self,
        input: &Path,
        _model: &ResolvedModel,
        output: &Path,
        _params: &ConversionParams,
    ) -> AppResult<()> {
        self.converts.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock() = Some(input.to_path_buf());
        self.in_convert.store(true, Ordering::SeqCst);
        let result = match self.mode {
            VoiceMode::Succeed => std::fs::write(output, b"converted").map_err(AppError::from),
            VoiceMode::Fail => Err(AppError::Engine("rvc crashed".into())),
            VoiceMode::Silent => Ok(()),
            VoiceMode::Slow(delay) => {
                std::thread::sleep(delay);
                std::fs::write(output, b"converted").map_err(AppError::from)
            }
        };
        self.in_convert.store(false, Ordering::SeqCst);
        result
    }

    fn release(&self) {
        if self.in_convert.load(Ordering::SeqCst) {
            self.released_during_convert.store(true, Ordering::SeqCst);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// 写出合格 WAV 的转码桩
#[derive(Default)]
pub struct StubTranscoder {
    pub calls: AtomicUsize,
}

impl Transcoder for StubTranscoder {
    fn normalize_to_stereo(&self, input: &Path, output_dir: &Path) -> AppResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = stereo_copy_path(input, output_dir);
        write_wav(&output, 2, 44100);
        Ok(output)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub separator: Arc<StubSeparator>,
    pub voice: Arc<StubVoice>,
    pub transcoder: Arc<StubTranscoder>,
    pub scheduler: Arc<Scheduler>,
    pub events: crossbeam_channel::Receiver<ProgressEvent>,
}

pub struct HarnessBuilder {
    separator: StubSeparator,
    voice: VoiceMode,
    workers: usize,
    configure: Box<dyn FnOnce(&mut AppConfig)>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            separator: StubSeparator::default(),
            voice: VoiceMode::Succeed,
            workers: 2,
            configure: Box::new(|_| {}),
        }
    }

    pub fn separator(mut self, separator: StubSeparator) -> Self {
        self.separator = separator;
        self
    }

    pub fn voice(mut self, mode: VoiceMode) -> Self {
        self.voice = mode;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut AppConfig) + 'static) -> Self {
        self.configure = Box::new(f);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.output.output_root = dir.path().join("out");
        config.voice.models_dir = dir.path().join("voices");
        std::fs::create_dir_all(&config.voice.models_dir).unwrap();
        (self.configure)(&mut config);

        let separator = Arc::new(self.separator);
        let voice = Arc::new(StubVoice::new(self.voice));
        let transcoder = Arc::new(StubTranscoder::default());
        let engines = Engines {
            separation: separator.clone(),
            voice: voice.clone(),
            transcoder: transcoder.clone(),
            models: Arc::new(FsModelRegistry::new(config.voice.models_dir.clone())),
        };
        let runner = Arc::new(PipelineRunner::new(engines, &config));
        let scheduler = Scheduler::new(runner, self.workers);
        let (observer, events) = ChannelObserver::new();
        scheduler.subscribe(Arc::new(observer));

        Harness {
            dir,
            separator,
            voice,
            transcoder,
            scheduler,
            events,
        }
    }
}

impl Harness {
    /// 在临时目录里放一个合格的双声道 WAV
    pub fn wav_input(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        write_wav(&path, 2, 44100);
        path
    }

    /// 建立一个变声模型目录；`with_primary` 为 false 时只有索引文件
    pub fn voice_model(&self, name: &str, with_primary: bool) {
        let model_dir = self.dir.path().join("voices").join(name);
        std::fs::create_dir_all(&model_dir).unwrap();
        if with_primary {
            std::fs::write(model_dir.join(format!("{}.pth", name)), b"weights").unwrap();
        }
        std::fs::write(model_dir.join("added.index"), b"index").unwrap();
    }

    pub fn wait(&self, job_id: &str) -> Job {
        self.scheduler
            .wait_for(job_id, Duration::from_secs(20))
            .expect("job did not finish in time")
    }

    /// 取出目前收到的全部事件
    pub fn drain_events(&self) -> Vec<ProgressEvent> {
        self.events.try_iter().collect()
    }

    pub fn events_for(&self, job_id: &str) -> Vec<ProgressEvent> {
        self.drain_events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }
}
