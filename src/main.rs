// vocalsplit - 命令行入口
//
// 提交所有输入文件，打印进度，等待全部任务结束后输出汇总。

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vocalsplit::audio::ffmpeg::FfmpegTranscoder;
use vocalsplit::audio::separator::AudioSeparatorCli;
use vocalsplit::audio::voice::RvcProcessEngine;
use vocalsplit::config::{get_config, init_config};
use vocalsplit::jobs::ChannelObserver;
use vocalsplit::utils::{get_exe_dir, has_supported_extension, SUPPORTED_EXTENSIONS};
use vocalsplit::{
    logging, AppConfig, AppResult, Engines, FsModelRegistry, Job, JobState, ModelRegistry,
    PipelineRunner, Scheduler,
};

#[derive(Parser, Debug)]
#[command(name = "vocalsplit", version, about = "多阶段人声分离与变声")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// 数据目录（配置、日志、模型、输出）
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// 同时运行的任务数，默认取配置文件
    #[arg(short, long)]
    workers: Option<usize>,

    /// 设备提示：cpu 或 cuda
    #[arg(short, long, default_value = "cpu")]
    device: String,

    /// 变声模型名称，不提供则跳过变声
    #[arg(long)]
    voice_model: Option<String>,

    /// 以 JSON 输出任务汇总
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// 输入音频文件
    files: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 列出可用的变声模型
    Models,
}

/// 数据目录：命令行参数 > 系统本地数据目录 > 可执行文件旁的 data
fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| dirs::data_local_dir().map(|d| d.join("vocalsplit")))
        .or_else(|| get_exe_dir().map(|d| d.join("data")))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn main() {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir.clone());

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("无法创建数据目录 {}: {}", data_dir.display(), e);
        process::exit(1);
    }
    if let Err(e) = init_config(&data_dir.join("config.json")) {
        eprintln!("配置初始化失败: {}", e);
        process::exit(1);
    }
    let config = get_config().rooted_at(&data_dir);

    // guard 必须保持存活，否则异步日志线程会退出
    let log_guard = logging::init_logging(&data_dir, &config.log_level);
    info!("vocalsplit 启动，数据目录: {}", data_dir.display());

    let code = match run(cli, config) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("错误: {}", e);
            1
        }
    };
    // process::exit 不会运行析构，先刷新日志
    drop(log_guard);
    process::exit(code);
}

/// 返回是否全部任务成功
fn run(cli: Cli, config: AppConfig) -> AppResult<bool> {
    let models = Arc::new(FsModelRegistry::new(config.voice.models_dir.clone()));

    if let Some(Command::Models) = cli.command {
        let names = models.list();
        if names.is_empty() {
            println!("没有找到变声模型: {}", models.root().display());
        }
        for name in names {
            println!("{}", name);
        }
        return Ok(true);
    }

    if cli.files.is_empty() {
        eprintln!("没有输入文件");
        return Ok(false);
    }

    let timeout = config.scheduler.stage_timeout();
    let engines = Engines {
        separation: Arc::new(AudioSeparatorCli::new(&config.separation, timeout)),
        voice: Arc::new(RvcProcessEngine::new(&config.voice, timeout)),
        transcoder: Arc::new(FfmpegTranscoder::new(timeout)),
        models,
    };
    std::fs::create_dir_all(&config.output.output_root)?;

    let runner = Arc::new(PipelineRunner::new(engines, &config));
    let workers = cli.workers.unwrap_or(config.scheduler.max_workers);
    let scheduler = Scheduler::new(runner, workers);

    let (observer, events) = ChannelObserver::new();
    scheduler.subscribe(Arc::new(observer));
    let quiet = cli.json;
    let printer = std::thread::spawn(move || {
        for event in events {
            if !quiet {
                println!(
                    "[{}] {:>3}% {:<8} {}",
                    &event.job_id[..event.job_id.len().min(8)],
                    event.percent,
                    event.state,
                    event.message
                );
            }
        }
    });

    let ids: Vec<String> = cli
        .files
        .iter()
        .map(|file| {
            warn_unsupported(file);
            scheduler.submit(file.clone(), cli.voice_model.clone(), cli.device.clone())
        })
        .collect();

    let mut finished: Vec<Job> = Vec::with_capacity(ids.len());
    for id in &ids {
        // 阶段超时保证任务最终结束，这里不设上限
        while scheduler.status(id).is_ok() {
            if let Some(job) = scheduler.wait_for(id, Duration::from_secs(60)) {
                finished.push(job);
                break;
            }
        }
    }

    drop(scheduler);
    // 所有发送端释放后打印线程自然退出
    let _ = printer.join();

    print_summary(&finished, cli.json)?;
    Ok(finished.iter().all(|j| j.state == JobState::Done))
}

fn warn_unsupported(file: &Path) {
    if !has_supported_extension(file) {
        warn!("不常见的音频扩展名: {}", file.display());
        eprintln!(
            "警告: {} 的扩展名不在支持列表中 ({})",
            file.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        );
    }
}

fn print_summary(jobs: &[Job], json: bool) -> AppResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }

    println!("\n=== 处理结果 ===");
    for job in jobs {
        println!("{} [{}] {}", job.song_id, job.state, job.input_path.display());
        match job.state {
            JobState::Done => {
                for (role, path) in &job.artifacts {
                    println!("  {:<12} {}", role.suffix(), path.display());
                }
                if let Some(vocal) = &job.final_vocal {
                    println!("  {:<12} {}", "最终人声", vocal.display());
                }
            }
            JobState::Failed => {
                if let Some(error) = &job.error {
                    println!("  错误: {}", error);
                }
                for path in &job.diagnostic_paths {
                    println!("  诊断文件: {}", path.display());
                }
            }
            _ => {}
        }
        for warning in &job.warnings {
            println!("  警告: {}", warning);
        }
    }
    Ok(())
}
