// 最佳人声回退链：去混响人声 -> 主唱 -> 原始人声

use crate::jobs::job::ArtifactRole;
use crate::utils::is_usable_file;
use std::collections::BTreeMap;
use std::path::PathBuf;

const PREFERRED: [ArtifactRole; 2] = [ArtifactRole::DeReverb, ArtifactRole::Main];

/// 从已产生的输出中选出最佳人声
///
/// 原始人声不做存在性检查：能走到这里说明第一阶段已经成功。
pub fn select_best_vocal(produced: &BTreeMap<ArtifactRole, PathBuf>) -> Option<(ArtifactRole, PathBuf)> {
    PREFERRED
        .iter()
        .find_map(|role| {
            produced
                .get(role)
                .filter(|path| is_usable_file(path))
                .map(|path| (*role, path.clone()))
        })
        .or_else(|| {
            produced
                .get(&ArtifactRole::Vocals)
                .map(|path| (ArtifactRole::Vocals, path.clone()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        produced: BTreeMap<ArtifactRole, PathBuf>,
    }

    /// 为每个角色建立路径，`present` 里的角色写入非空文件
    fn fixture(present: &[ArtifactRole], empty: &[ArtifactRole]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut produced = BTreeMap::new();
        for role in [ArtifactRole::Vocals, ArtifactRole::Main, ArtifactRole::DeReverb] {
            let path = dir.path().join(format!("song_{}.wav", role.suffix()));
            if present.contains(&role) {
                fs::write(&path, b"audio").unwrap();
            } else if empty.contains(&role) {
                fs::write(&path, b"").unwrap();
            }
            produced.insert(role, path);
        }
        Fixture { _dir: dir, produced }
    }

    fn chosen(f: &Fixture) -> ArtifactRole {
        select_best_vocal(&f.produced).unwrap().0
    }

    #[test]
    fn prefers_dereverb() {
        let f = fixture(&[ArtifactRole::Vocals, ArtifactRole::Main, ArtifactRole::DeReverb], &[]);
        assert_eq!(chosen(&f), ArtifactRole::DeReverb);
    }

    #[test]
    fn falls_back_to_main_when_dereverb_missing_or_empty() {
        let missing = fixture(&[ArtifactRole::Vocals, ArtifactRole::Main], &[]);
        assert_eq!(chosen(&missing), ArtifactRole::Main);

        let empty = fixture(&[ArtifactRole::Vocals, ArtifactRole::Main], &[ArtifactRole::DeReverb]);
        assert_eq!(chosen(&empty), ArtifactRole::Main);
    }

    #[test]
    fn falls_back_to_raw_when_both_missing() {
        let f = fixture(&[ArtifactRole::Vocals], &[]);
        let (role, path) = select_best_vocal(&f.produced).unwrap();
        assert_eq!(role, ArtifactRole::Vocals);
        assert_eq!(path, f.produced[&ArtifactRole::Vocals]);
    }

    #[test]
    fn dereverb_alone_beats_missing_main() {
        let f = fixture(&[ArtifactRole::Vocals, ArtifactRole::DeReverb], &[]);
        assert_eq!(chosen(&f), ArtifactRole::DeReverb);
    }

    #[test]
    fn nothing_produced_yields_none() {
        assert!(select_best_vocal(&BTreeMap::new()).is_none());
    }
}
