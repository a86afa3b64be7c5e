// 工具模块

use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows 下隐藏控制台窗口的标志
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// 支持提交的音频扩展名
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "m4a", "aac", "wma"];

/// 创建一个隐藏控制台窗口的 Command（Windows 专用）
/// 在非 Windows 平台上等同于 Command::new
#[cfg(target_os = "windows")]
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

#[cfg(not(target_os = "windows"))]
pub fn hidden_command(program: &str) -> Command {
    Command::new(program)
}

/// 生成 UUID
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 获取可执行文件所在目录
pub fn get_exe_dir() -> Option<PathBuf> {
    std::env::current_exe().ok()?.parent().map(|p| p.to_path_buf())
}

/// 解析外部工具路径，优先使用可执行文件旁边的打包版本
pub fn resolve_tool_path(tool_name: &str) -> String {
    if let Some(exe_dir) = get_exe_dir() {
        let candidates = [
            exe_dir.join(tool_name).join(tool_name),
            exe_dir.join(tool_name),
            exe_dir.join(format!("{}.exe", tool_name)),
        ];
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return found.to_string_lossy().to_string();
        }
    }
    // 回退到系统 PATH
    tool_name.to_string()
}

/// 文件存在且非空
pub fn is_usable_file(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// 歌曲 ID：输入文件名去掉扩展名
pub fn song_id_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "audio".to_string())
}

/// 扩展名是否在支持列表中（不区分大小写）
pub fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn song_id_strips_extension() {
        assert_eq!(song_id_of(Path::new("/tmp/uploads/song.wav")), "song");
        assert_eq!(song_id_of(Path::new("my.track.mp3")), "my.track");
        assert_eq!(song_id_of(Path::new("/")), "audio");
    }

    #[test]
    fn empty_file_is_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.wav");
        let full = dir.path().join("full.wav");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"data").unwrap();

        assert!(!is_usable_file(&empty));
        assert!(is_usable_file(&full));
        assert!(!is_usable_file(&dir.path().join("missing.wav")));
        assert!(!is_usable_file(dir.path()));
    }

    #[test]
    fn extension_check_ignores_case() {
        assert!(has_supported_extension(Path::new("a.FLAC")));
        assert!(!has_supported_extension(Path::new("a.txt")));
        assert!(!has_supported_extension(Path::new("noext")));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
