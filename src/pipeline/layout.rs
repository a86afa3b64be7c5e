// 输出目录布局
//
// <output_root>/<job_id>/<song_id>_<Role>.<ext>
// 任务 ID 全局唯一，同名文件的两个任务不会写入同一目录。

use crate::jobs::job::ArtifactRole;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    format: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            format: format.into(),
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn artifact_path(&self, job_id: &str, song_id: &str, role: ArtifactRole) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("{}_{}.{}", song_id, role.suffix(), self.format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_song_different_jobs_get_disjoint_dirs() {
        let layout = OutputLayout::new("/out", "wav");
        let a = layout.artifact_path("job-a", "song", ArtifactRole::Vocals);
        let b = layout.artifact_path("job-b", "song", ArtifactRole::Vocals);
        assert_ne!(a.parent(), b.parent());
        assert_eq!(a, PathBuf::from("/out/job-a/song_Vocals.wav"));
    }

    #[test]
    fn every_role_has_a_distinct_file() {
        let layout = OutputLayout::new("/out", "flac");
        let mut paths: Vec<PathBuf> = ArtifactRole::ALL
            .iter()
            .map(|r| layout.artifact_path("j", "s", *r))
            .collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), ArtifactRole::ALL.len());
        assert!(paths.iter().all(|p| p.extension().unwrap() == "flac"));
    }
}
