//! 文件名分类：生成 strm / 直接下载 / 忽略

/// 文件分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// 生成 strm 文件
    Target,
    /// 下载到本地（字幕、海报等附属文件）
    SideAsset,
    Ignored,
}

/// 扩展名过滤器
#[derive(Debug, Clone, Default)]
pub struct ExtFilter {
    exts: Vec<String>,
    alt_exts: Vec<String>,
}

impl ExtFilter {
    pub fn new(exts: &[String], alt_exts: &[String]) -> Self {
        Self {
            exts: exts.iter().map(|e| normalize_ext(e)).collect(),
            alt_exts: alt_exts.iter().map(|e| normalize_ext(e)).collect(),
        }
    }

    /// 按扩展名分类，同时出现在两个列表中时优先生成 strm
    pub fn classify(&self, name: &str) -> FileKind {
        let Some(ext) = extension(name) else {
            return FileKind::Ignored;
        };
        let ext = ext.to_lowercase();
        if self.exts.iter().any(|e| *e == ext) {
            FileKind::Target
        } else if self.alt_exts.iter().any(|e| *e == ext) {
            FileKind::SideAsset
        } else {
            FileKind::Ignored
        }
    }
}

/// 统一为带点的小写形式
fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// 最后一个点开始的扩展名（包含点）
pub fn extension(name: &str) -> Option<&str> {
    name.rfind('.').map(|i| &name[i..])
}

/// 去掉扩展名后的文件名
pub fn stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) => &name[..i],
        None => name,
    }
}
