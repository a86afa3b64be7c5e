// 外部进程执行
//
// stderr 由独立线程逐行读取并经 channel 转发，主循环轮询进程状态与截止时间，
// 超时直接 kill，避免留下孤儿进程占用 GPU。

use crate::error::{AppError, AppResult};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// 保留的 stderr 尾部行数（用于错误信息）
const STDERR_TAIL_LINES: usize = 40;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stderr_tail: String,
}

impl ProcessOutput {
    /// 截取错误信息，最多 500 字符
    pub fn error_summary(&self) -> String {
        if self.stderr_tail.is_empty() {
            "（无详细错误信息）".to_string()
        } else {
            self.stderr_tail.chars().take(500).collect()
        }
    }
}

/// 运行外部命令直到退出或超时
///
/// 每读到一行 stderr 就回调 `on_line`。启动失败返回 `AppError::Io`，超时返回 `AppError::Timeout`。
pub fn run_with_deadline(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
    mut on_line: impl FnMut(&str),
) -> AppResult<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        error!("启动 {} 失败: {}", label, e);
        AppError::Io(e)
    })?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Engine(format!("无法获取 {} 错误输出流", label)))?;

    let (tx, rx) = unbounded::<String>();
    let reader_thread = std::thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let deadline = Instant::now() + timeout;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut push_line = |line: String, tail: &mut VecDeque<String>| {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return;
        }
        debug!("{} stderr: {}", label, trimmed);
        on_line(trimmed);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(trimmed.to_string());
    };

    let status = loop {
        if let Some(line) = next_line(&rx) {
            push_line(line, &mut tail);
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    error!("{} 超时 ({:?})，终止进程", label, timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AppError::Timeout(format!("{} 超过 {:?} 未完成", label, timeout)));
                }
            }
            Err(e) => {
                let _ = child.kill();
                return Err(AppError::Engine(format!("检查 {} 进程状态失败: {}", label, e)));
            }
        }
    };

    // 进程已退出，读取剩余输出
    let _ = reader_thread.join();
    for line in rx.try_iter() {
        push_line(line, &mut tail);
    }

    Ok(ProcessOutput {
        status,
        stderr_tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
    })
}

/// 等待下一行 stderr；读取线程已结束时按轮询间隔休眠
fn next_line(rx: &Receiver<String>) -> Option<String> {
    match rx.recv_timeout(POLL_INTERVAL) {
        Ok(line) => Some(line),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => {
            std::thread::sleep(POLL_INTERVAL);
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn collects_stderr_lines() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one >&2; echo two >&2"]);
        let mut seen = Vec::new();
        let output = run_with_deadline(cmd, "sh", Duration::from_secs(10), |l| seen.push(l.to_string())).unwrap();
        assert!(output.status.success());
        assert_eq!(seen, vec!["one", "two"]);
        assert_eq!(output.stderr_tail, "one\ntwo");
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let started = Instant::now();
        let err = run_with_deadline(cmd, "sh", Duration::from_millis(200), |_| {}).err().unwrap();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_io_error() {
        let cmd = Command::new("definitely-not-a-real-program-xyz");
        let err = run_with_deadline(cmd, "x", Duration::from_secs(1), |_| {}).err().unwrap();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn closed_stderr_still_waits_between_polls() {
        let (tx, rx) = unbounded::<String>();
        drop(tx);
        let started = Instant::now();
        assert!(next_line(&rx).is_none());
        assert!(started.elapsed() >= POLL_INTERVAL);
    }

    #[test]
    fn process_outliving_its_stderr_completes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec 2>&-; sleep 0.3"]);
        let output = run_with_deadline(cmd, "sh", Duration::from_secs(10), |_| {}).unwrap();
        assert!(output.status.success());
        assert!(output.stderr_tail.is_empty());
    }
}
