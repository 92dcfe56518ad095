//! 记录数据库
//!
//! 保存两类数据：已处理的远程目录（增量更新时跳过）和已生成的 strm 记录
//! （以播放地址指纹为键）。数据库文件旁边的 `.lock` 文件持有排他锁，
//! 同一时间只允许一个进程写入。

pub mod models;
pub use models::*;

use crate::core::strm::StrmEntry;
use crate::error::{StrmError, StrmResult};
use fs2::FileExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RecordStore {
    pool: SqlitePool,
    path: PathBuf,
    _lock: File,
}

impl RecordStore {
    /// 打开（必要时创建）数据库并获取排他锁
    pub async fn open(path: &Path) -> StrmResult<Self> {
        let unavailable = |message: String| StrmError::StorageUnavailable {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| unavailable(format!("创建目录失败: {}", e)))?;
        }

        let lock_path = lock_path(path);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| unavailable(format!("打开锁文件失败: {}", e)))?;
        lock.try_lock_exclusive()
            .map_err(|_| unavailable("数据库正被其他进程使用".to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await
            .map_err(|e| unavailable(format!("打开数据库失败: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| unavailable(format!("数据库迁移失败: {}", e)))?;

        info!("记录数据库已打开: {}", path.display());

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ============ 已处理目录 ============

    /// 标记目录已处理，`strm_count` 为该目录下的 strm 数量
    pub async fn mark_processed(&self, remote_dir: &str, strm_count: i64) -> StrmResult<()> {
        sqlx::query(
            r#"INSERT INTO processed_dirs (remote_dir, strm_count, marked_at)
               VALUES (?, ?, ?)
               ON CONFLICT(remote_dir) DO UPDATE SET
                   strm_count = excluded.strm_count,
                   marked_at = excluded.marked_at"#,
        )
        .bind(remote_dir)
        .bind(strm_count)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 批量标记，在一个事务中完成
    pub async fn mark_processed_batch(&self, dirs: &HashMap<String, i64>) -> StrmResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (remote_dir, count) in dirs {
            sqlx::query(
                r#"INSERT INTO processed_dirs (remote_dir, strm_count, marked_at)
                   VALUES (?, ?, ?)
                   ON CONFLICT(remote_dir) DO UPDATE SET
                       strm_count = excluded.strm_count,
                       marked_at = excluded.marked_at"#,
            )
            .bind(remote_dir)
            .bind(count)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("标记 {} 个目录为已处理", dirs.len());
        Ok(())
    }

    pub async fn is_processed(&self, remote_dir: &str) -> StrmResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM processed_dirs WHERE remote_dir = ?")
                .bind(remote_dir)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn unmark_processed(&self, remote_dir: &str) -> StrmResult<()> {
        sqlx::query("DELETE FROM processed_dirs WHERE remote_dir = ?")
            .bind(remote_dir)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 加载所有已处理目录
    pub async fn load_processed(&self) -> StrmResult<HashSet<String>> {
        let rows = sqlx::query_as::<_, ProcessedDirRow>("SELECT * FROM processed_dirs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.remote_dir).collect())
    }

    /// 用给定集合替换全部已处理目录
    pub async fn save_processed(&self, dirs: &HashMap<String, i64>) -> StrmResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM processed_dirs")
            .execute(&mut *tx)
            .await?;
        for (remote_dir, count) in dirs {
            sqlx::query(
                "INSERT INTO processed_dirs (remote_dir, strm_count, marked_at) VALUES (?, ?, ?)",
            )
            .bind(remote_dir)
            .bind(count)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!("已保存 {} 个已处理目录", dirs.len());
        Ok(())
    }

    // ============ strm 记录 ============

    pub async fn put_fingerprint(&self, entry: &StrmEntry) -> StrmResult<()> {
        sqlx::query(
            r#"INSERT INTO strm_records (fingerprint, remote_dir, descriptor, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(fingerprint) DO UPDATE SET
                   remote_dir = excluded.remote_dir,
                   descriptor = excluded.descriptor,
                   updated_at = excluded.updated_at"#,
        )
        .bind(entry.fingerprint())
        .bind(&entry.remote_dir)
        .bind(serde_json::to_string(entry)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 批量写入，在一个事务中完成
    pub async fn put_fingerprints(&self, entries: &[StrmEntry]) -> StrmResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"INSERT INTO strm_records (fingerprint, remote_dir, descriptor, updated_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(fingerprint) DO UPDATE SET
                       remote_dir = excluded.remote_dir,
                       descriptor = excluded.descriptor,
                       updated_at = excluded.updated_at"#,
            )
            .bind(entry.fingerprint())
            .bind(&entry.remote_dir)
            .bind(serde_json::to_string(entry)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("写入 {} 条 strm 记录", entries.len());
        Ok(())
    }

    pub async fn get_fingerprint(&self, fingerprint: &str) -> StrmResult<Option<StrmEntry>> {
        let row = sqlx::query_as::<_, StrmRecordRow>(
            "SELECT * FROM strm_records WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    pub async fn delete_fingerprint(&self, fingerprint: &str) -> StrmResult<()> {
        sqlx::query("DELETE FROM strm_records WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 加载全部 strm 记录，无法解析的记录跳过
    pub async fn load_all(&self) -> StrmResult<HashMap<String, StrmEntry>> {
        let rows = sqlx::query_as::<_, StrmRecordRow>("SELECT * FROM strm_records")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let fingerprint = row.fingerprint.clone();
            match StrmEntry::try_from(row) {
                Ok(entry) => {
                    map.insert(fingerprint, entry);
                }
                Err(e) => warn!("跳过损坏的记录 {}: {}", fingerprint, e),
            }
        }
        Ok(map)
    }

    /// 用给定记录替换全部 strm 记录
    pub async fn save_all(&self, entries: &HashMap<String, StrmEntry>) -> StrmResult<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM strm_records")
            .execute(&mut *tx)
            .await?;
        for (fingerprint, entry) in entries {
            sqlx::query(
                "INSERT INTO strm_records (fingerprint, remote_dir, descriptor, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(fingerprint)
            .bind(&entry.remote_dir)
            .bind(serde_json::to_string(entry)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!("已保存 {} 条 strm 记录", entries.len());
        Ok(())
    }

    /// 关闭连接池，锁随之释放
    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}
