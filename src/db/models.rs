use crate::core::strm::StrmEntry;

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StrmRecordRow {
    pub fingerprint: String,
    pub remote_dir: String,
    pub descriptor: String,
    pub updated_at: i64,
}

impl TryFrom<StrmRecordRow> for StrmEntry {
    type Error = serde_json::Error;

    fn try_from(row: StrmRecordRow) -> Result<Self, Self::Error> {
        serde_json::from_str(&row.descriptor)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
#[allow(dead_code)]
pub struct ProcessedDirRow {
    pub remote_dir: String,
    pub strm_count: i64,
    pub marked_at: i64,
}
