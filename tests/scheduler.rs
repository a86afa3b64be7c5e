// 调度器的并发行为

mod common;

use common::{HarnessBuilder, StubSeparator};
use std::collections::HashSet;
use std::time::Duration;
use vocalsplit::{CancelOutcome, ErrorKind, JobState};

#[test]
fn running_jobs_never_exceed_worker_count() {
    let h = HarnessBuilder::new()
        .workers(2)
        .separator(StubSeparator::slow(Duration::from_millis(30)))
        .build();
    let ids: Vec<String> = (0..6)
        .map(|i| h.scheduler.submit(h.wav_input(&format!("song{}.wav", i)), None, "cpu"))
        .collect();

    // 轮询注册表
    let mut peak = 0;
    while !ids
        .iter()
        .all(|id| h.scheduler.status(id).unwrap().state.is_terminal())
    {
        let running = h.scheduler.registry().count_in_state(JobState::Running);
        assert!(running <= 2, "{} running", running);
        peak = peak.max(running);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(peak >= 1);

    // 事件流里的 Running 数同样不超过上限
    let mut running = HashSet::new();
    for event in h.drain_events() {
        match event.state {
            JobState::Running => {
                running.insert(event.job_id);
            }
            JobState::Done | JobState::Failed => {
                running.remove(&event.job_id);
            }
            JobState::Queued => {}
        }
        assert!(running.len() <= 2);
    }

    for id in &ids {
        assert_eq!(h.wait(id).state, JobState::Done);
    }
}

#[test]
fn same_base_name_jobs_get_disjoint_directories() {
    let h = HarnessBuilder::new().workers(2).build();
    let first = h.wav_input("a/song.wav");
    let second = h.wav_input("b/song.wav");

    let id1 = h.scheduler.submit(first, None, "cpu");
    let id2 = h.scheduler.submit(second, None, "cpu");
    let job1 = h.wait(&id1);
    let job2 = h.wait(&id2);

    assert_eq!(job1.song_id, job2.song_id);
    assert_ne!(job1.output_dir, job2.output_dir);
    for (role, path) in &job1.artifacts {
        assert_ne!(Some(path), job2.artifacts.get(role));
        assert!(path.is_file());
    }
    assert!(job2.artifacts.values().all(|p| p.is_file()));
}

#[test]
fn submission_order_governs_admission() {
    let h = HarnessBuilder::new()
        .workers(1)
        .separator(StubSeparator::slow(Duration::from_millis(20)))
        .build();
    let ids: Vec<String> = (0..3)
        .map(|i| h.scheduler.submit(h.wav_input(&format!("s{}.wav", i)), None, "cpu"))
        .collect();
    for id in &ids {
        h.wait(id);
    }

    let started: Vec<String> = h
        .drain_events()
        .into_iter()
        .filter(|e| e.state == JobState::Running && e.percent == 0)
        .fold(Vec::new(), |mut acc, e| {
            if !acc.contains(&e.job_id) {
                acc.push(e.job_id);
            }
            acc
        });
    assert_eq!(started, ids);

    let jobs = h.scheduler.list();
    for pair in jobs.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
    }
}

#[test]
fn cancel_running_job_reports_cancelled() {
    let h = HarnessBuilder::new()
        .workers(1)
        .separator(StubSeparator::slow(Duration::from_millis(300)))
        .build();
    let running = h.scheduler.submit(h.wav_input("a.wav"), None, "cpu");
    let queued = h.scheduler.submit(h.wav_input("b.wav"), None, "cpu");

    assert_eq!(h.scheduler.cancel(&queued), CancelOutcome::Removed);
    assert!(h.scheduler.status(&queued).is_err());
    assert_eq!(h.scheduler.cancel(&running), CancelOutcome::Flagged);

    let job = h.wait(&running);
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Cancelled);
    // 进行中的阶段不会被打断，但后续阶段不再执行
    assert!(h.separator.call_count() <= 1);
    assert_eq!(h.scheduler.list().len(), 1);
}
