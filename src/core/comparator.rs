use crate::core::strm::StrmEntry;
use std::collections::HashMap;

/// 更新模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// 以本地为准：只补充远程新增的文件，从不删除
    Local,
    /// 以远程为准：删除远程已不存在的文件
    Remote,
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMode::Local => write!(f, "local"),
            UpdateMode::Remote => write!(f, "remote"),
        }
    }
}

/// 对比结果，两个列表都按本地路径排序
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    pub to_add: Vec<StrmEntry>,
    pub to_delete: Vec<StrmEntry>,
    pub unchanged: usize,
}

impl ReconcileResult {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// 按指纹对比本地和远程的 strm 集合
///
/// 指纹相同即视为同一文件，即使文件名或本地位置不同。
pub fn reconcile(
    local: &HashMap<String, StrmEntry>,
    remote: &HashMap<String, StrmEntry>,
    mode: UpdateMode,
) -> ReconcileResult {
    let mut result = ReconcileResult::default();

    for (fingerprint, entry) in remote {
        if local.contains_key(fingerprint) {
            result.unchanged += 1;
        } else {
            result.to_add.push(entry.clone());
        }
    }

    if mode == UpdateMode::Remote {
        result.to_delete = local
            .iter()
            .filter(|(fingerprint, _)| !remote.contains_key(*fingerprint))
            .map(|(_, entry)| entry.clone())
            .collect();
    }

    // 排序保证日志输出稳定
    result.to_add.sort_by_key(StrmEntry::path);
    result.to_delete.sort_by_key(StrmEntry::path);

    tracing::debug!(
        "对比完成 ({}): 新增 {}, 删除 {}, 未变 {}",
        mode,
        result.to_add.len(),
        result.to_delete.len(),
        result.unchanged
    );

    result
}
