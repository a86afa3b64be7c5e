// 变声模型管理模块
//
// 目录布局：<models_dir>/<模型名>/ 下放一个 .pth 主模型文件，可选一个 .index 索引文件

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PRIMARY_EXT: &str = "pth";
const INDEX_EXT: &str = "index";

/// 解析后的模型文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModel {
    /// 模型引用名
    pub name: String,
    pub primary_file: PathBuf,
    pub aux_index_file: Option<PathBuf>,
}

/// 变声模型查找
pub trait ModelRegistry: Send + Sync {
    fn resolve(&self, model_ref: &str) -> AppResult<ResolvedModel>;

    /// 列出可用的模型引用（按名称排序）
    fn list(&self) -> Vec<String>;
}

/// 基于文件系统的模型目录
#[derive(Debug, Clone)]
pub struct FsModelRegistry {
    root: PathBuf,
}

impl FsModelRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan_model_dir(model_dir: &Path) -> AppResult<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut primaries = Vec::new();
        let mut indexes = Vec::new();
        for entry in fs::read_dir(model_dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if ext == PRIMARY_EXT {
                primaries.push(path);
            } else if ext == INDEX_EXT {
                indexes.push(path);
            }
        }
        primaries.sort();
        indexes.sort();
        Ok((primaries, indexes))
    }
}

impl ModelRegistry for FsModelRegistry {
    fn resolve(&self, model_ref: &str) -> AppResult<ResolvedModel> {
        // 模型引用只能是单层目录名
        let is_plain_name = !model_ref.is_empty()
            && Path::new(model_ref).components().count() == 1
            && !model_ref.contains("..");
        if !is_plain_name {
            return Err(AppError::ModelNotFound(format!("非法的模型名称: {}", model_ref)));
        }

        let model_dir = self.root.join(model_ref);
        if !model_dir.is_dir() {
            return Err(AppError::ModelNotFound(format!(
                "模型目录不存在: {}",
                model_dir.display()
            )));
        }

        let (primaries, indexes) = Self::scan_model_dir(&model_dir)?;
        let primary_file = primaries.first().cloned().ok_or_else(|| {
            AppError::ModelNotFound(format!("模型目录中未找到 .pth: {}", model_dir.display()))
        })?;
        if primaries.len() > 1 {
            warn!("[MODELS] 模型目录中有多个 .pth，使用 {}", primary_file.display());
        }
        if indexes.len() > 1 {
            warn!("[MODELS] 模型目录中有多个 .index，使用第一个");
        }

        debug!("[MODELS] 解析模型 {} -> {}", model_ref, primary_file.display());
        Ok(ResolvedModel {
            name: model_ref.to_string(),
            primary_file,
            aux_index_file: indexes.into_iter().next(),
        })
    }

    fn list(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter(|e| {
                Self::scan_model_dir(&e.path())
                    .map(|(primaries, _)| !primaries.is_empty())
                    .unwrap_or(false)
            })
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}
