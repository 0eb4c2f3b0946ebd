//! 基于文件的系统提示词：注入（append/overwrite）与捕获（写入调用方的 system）。
//!
//! 文件每次决策前重新读取，不做缓存。

use anyhow::Context;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemPromptMode {
    #[default]
    Off,
    Append,
    Overwrite,
}

impl SystemPromptMode {
    pub fn parse(v: &str) -> Self {
        match v.trim().to_lowercase().as_str() {
            "append" => Self::Append,
            "overwrite" | "override" | "replace" => Self::Overwrite,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemPromptConfig {
    pub file_path: Option<PathBuf>,
    pub mode: SystemPromptMode,
    pub capture_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Written,
    Cleared,
    Unchanged,
}

/// 合并调用方 system 与文件内容；返回 None 表示不修改请求。
pub fn merge_system_text(caller: Option<&str>, file: &str, mode: SystemPromptMode) -> Option<String> {
    if file.is_empty() {
        return None;
    }
    match mode {
        SystemPromptMode::Off => None,
        SystemPromptMode::Overwrite => Some(file.to_string()),
        SystemPromptMode::Append => match caller.filter(|s| !s.is_empty()) {
            Some(a) => Some(format!("{a}\n{file}")),
            None => Some(file.to_string()),
        },
    }
}

/// 读取文件内容；文件不存在视为空。
pub async fn read_prompt_file(path: &Path) -> anyhow::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s.trim_end_matches(['\r', '\n']).to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("读取系统提示词文件失败: {}", path.display())),
    }
}

/// 写入调用方的 system 文本：内容不同才写；调用方没有 system 但文件非空时清空。
pub async fn sync_capture_file(path: &Path, caller: Option<&str>) -> anyhow::Result<CaptureOutcome> {
    let current = read_prompt_file(path).await?;
    // 与读取时同样去掉末尾换行再比较
    let caller = caller.unwrap_or("").trim_end_matches(['\r', '\n']);

    if caller.is_empty() {
        if current.is_empty() {
            return Ok(CaptureOutcome::Unchanged);
        }
        tokio::fs::write(path, b"")
            .await
            .with_context(|| format!("清空系统提示词文件失败: {}", path.display()))?;
        return Ok(CaptureOutcome::Cleared);
    }

    if current == caller {
        return Ok(CaptureOutcome::Unchanged);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }
    tokio::fs::write(path, caller.as_bytes())
        .await
        .with_context(|| format!("写入系统提示词文件失败: {}", path.display()))?;
    Ok(CaptureOutcome::Written)
}
