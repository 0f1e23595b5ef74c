use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// 重名时最多尝试的序号
const MAX_UNIQUE_ATTEMPTS: u32 = 9999;

/// 目录句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderHandle {
    path: PathBuf,
}

/// 新建的目标文件
#[derive(Debug, Clone)]
pub struct CreatedFile {
    /// 实际文件名（可能带重名序号）
    pub name: String,
    /// 完整路径
    pub path: PathBuf,
}

impl FolderHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 目录下某个文件的完整路径
    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }

    /// 在目录下创建新文件，绝不覆盖已有文件
    ///
    /// 依次尝试 `name.ext`、`name(1).ext`、`name(2).ext` ...
    pub async fn create_unique_file(&self, desired_name: &str) -> io::Result<CreatedFile> {
        validate_file_name(desired_name)?;

        for attempt in 0..=MAX_UNIQUE_ATTEMPTS {
            let name = numbered_file_name(desired_name, attempt);
            let path = self.path.join(&name);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    debug!("已创建目标文件: {:?}", path);
                    return Ok(CreatedFile { name, path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("无法为 {} 生成不重名的文件名", desired_name),
        ))
    }
}

/// 生成带序号的文件名，序号 0 表示原名
fn numbered_file_name(desired_name: &str, index: u32) -> String {
    if index == 0 {
        return desired_name.to_string();
    }

    let path = Path::new(desired_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| desired_name.to_string());

    match path.extension() {
        Some(ext) => format!("{}({}).{}", stem, index, ext.to_string_lossy()),
        None => format!("{}({})", stem, index),
    }
}

/// 文件名只能是单级名称
fn validate_file_name(name: &str) -> io::Result<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');

    if invalid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("非法文件名: {:?}", name),
        ));
    }
    Ok(())
}
