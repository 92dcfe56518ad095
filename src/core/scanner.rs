use crate::core::filter::{ExtFilter, FileKind};
use crate::core::strm::StrmEntry;
use crate::core::transfer::{AssetDownloader, DownloadOutcome};
use crate::error::{StrmError, StrmResult};
use crate::storage::{RemoteEntry, RemoteLister};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 一个待展开的远程目录
#[derive(Debug, Clone)]
pub struct DirectoryTask {
    pub remote_dir: String,
    pub local_dir: PathBuf,
    pub recursive: bool,
    /// 是否为每个远程子目录创建本地子目录
    pub create_sub_directory: bool,
    pub force_refresh: bool,
}

impl DirectoryTask {
    fn child(&self, name: &str) -> Self {
        Self {
            remote_dir: join_remote(&self.remote_dir, name),
            local_dir: if self.create_sub_directory {
                self.local_dir.join(name)
            } else {
                self.local_dir.clone()
            },
            recursive: self.recursive,
            create_sub_directory: self.create_sub_directory,
            force_refresh: self.force_refresh,
        }
    }
}

/// 拼接远程路径，原样保留名称（不做 URL 编码）
pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// 扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 同时进行的目录列举数量
    pub max_concurrent: usize,
    pub filter: ExtFilter,
    /// 输出通道容量，满时扫描任务等待消费
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            filter: ExtFilter::default(),
            channel_capacity: 1000,
        }
    }
}

/// 扫描统计
#[derive(Debug, Default)]
struct ScanStats {
    dirs_listed: AtomicU64,
    dirs_failed: AtomicU64,
    dirs_skipped: AtomicU64,
    strm_found: AtomicU64,
    assets_downloaded: AtomicU64,
    assets_skipped: AtomicU64,
    assets_failed: AtomicU64,
    failed_dirs: Mutex<Vec<String>>,
}

impl ScanStats {
    async fn snapshot(&self) -> ScanSummary {
        ScanSummary {
            dirs_listed: self.dirs_listed.load(Ordering::Relaxed),
            dirs_failed: self.dirs_failed.load(Ordering::Relaxed),
            dirs_skipped: self.dirs_skipped.load(Ordering::Relaxed),
            strm_found: self.strm_found.load(Ordering::Relaxed),
            assets_downloaded: self.assets_downloaded.load(Ordering::Relaxed),
            assets_skipped: self.assets_skipped.load(Ordering::Relaxed),
            assets_failed: self.assets_failed.load(Ordering::Relaxed),
            failed_dirs: self.failed_dirs.lock().await.clone(),
        }
    }
}

/// 扫描结束后的统计结果
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub dirs_listed: u64,
    pub dirs_failed: u64,
    /// 增量模式下跳过的目录
    pub dirs_skipped: u64,
    pub strm_found: u64,
    pub assets_downloaded: u64,
    pub assets_skipped: u64,
    pub assets_failed: u64,
    /// 列举失败的目录，其子树未被扫描
    pub failed_dirs: Vec<String>,
}

/// 所有扫描任务共享的状态
struct ScanContext {
    lister: Arc<dyn RemoteLister>,
    base_url: String,
    filter: ExtFilter,
    processed: Option<Arc<HashSet<String>>>,
    downloader: Option<AssetDownloader>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    tx: mpsc::Sender<StrmEntry>,
    stats: Arc<ScanStats>,
}

impl ScanContext {
    fn is_processed(&self, remote_dir: &str) -> bool {
        self.processed
            .as_ref()
            .map(|p| p.contains(remote_dir))
            .unwrap_or(false)
    }

    async fn download_asset(&self, task: &DirectoryTask, entry: &RemoteEntry) {
        let Some(downloader) = &self.downloader else {
            return;
        };
        let dest = task.local_dir.join(&entry.name);
        debug!(
            "发现附属文件 [{}]，下载到 [{}]",
            join_remote(&task.remote_dir, &entry.name),
            task.local_dir.display()
        );
        match downloader.download(&entry.raw_url, &dest, entry.size).await {
            Ok(DownloadOutcome::Downloaded(_)) => {
                self.stats.assets_downloaded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(DownloadOutcome::Exists) => {
                self.stats.assets_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("下载 [{}] 失败: {}", entry.raw_url, e);
                self.stats.assets_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// 远程目录树扫描器
///
/// 每展开一个目录占用一个并发名额，子目录作为新任务并发展开，
/// 生成的 strm 通过有界通道输出。某个子目录列举失败只放弃该子树。
pub struct StrmScanner {
    lister: Arc<dyn RemoteLister>,
    config: ScanConfig,
    processed: Option<Arc<HashSet<String>>>,
    downloader: Option<AssetDownloader>,
}

impl StrmScanner {
    pub fn new(lister: Arc<dyn RemoteLister>, config: ScanConfig) -> Self {
        Self {
            lister,
            config,
            processed: None,
            downloader: None,
        }
    }

    /// 启用增量模式：跳过已处理的目录
    pub fn with_processed(mut self, processed: Arc<HashSet<String>>) -> Self {
        self.processed = Some(processed);
        self
    }

    /// 启用附属文件下载
    pub fn with_downloader(mut self, downloader: AssetDownloader) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// 开始扫描
    ///
    /// 根目录在返回前列举，失败时返回 `Connectivity`；
    /// 其余目录在后台展开，结果从返回的流中读取。
    pub async fn scan(&self, root: DirectoryTask) -> StrmResult<ScanStream> {
        let max_concurrent = self.config.max_concurrent.max(1);
        info!(
            "开始扫描 {}{}，并发数 {}",
            self.lister.name(),
            root.remote_dir,
            max_concurrent
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let stats = Arc::new(ScanStats::default());
        let tracker = TaskTracker::new();
        let ctx = Arc::new(ScanContext {
            lister: self.lister.clone(),
            base_url: self.lister.base_url().trim_end_matches('/').to_string(),
            filter: self.config.filter.clone(),
            processed: self.processed.clone(),
            downloader: self.downloader.clone(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tracker: tracker.clone(),
            tx,
            stats: stats.clone(),
        });

        let permit = ctx
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StrmError::Connectivity {
                endpoint: self.lister.name().to_string(),
                message: e.to_string(),
            })?;

        let entries = self
            .lister
            .list(&root.remote_dir, root.force_refresh)
            .await
            .map_err(|e| StrmError::Connectivity {
                endpoint: self.lister.name().to_string(),
                message: format!("列举根目录 [{}] 失败: {:#}", root.remote_dir, e),
            })?;
        stats.dirs_listed.fetch_add(1, Ordering::Relaxed);
        debug!("从 [{}] 获取 {} 个条目", root.remote_dir, entries.len());

        tracker.spawn(process_entries(ctx, root, entries, permit));
        tracker.close();

        Ok(ScanStream {
            inner: ReceiverStream::new(rx),
            tracker,
            stats,
        })
    }
}

/// 展开一个子目录
fn expand(ctx: Arc<ScanContext>, task: DirectoryTask) -> BoxFuture<'static, ()> {
    async move {
        let Ok(permit) = ctx.semaphore.clone().acquire_owned().await else {
            return;
        };

        match ctx.lister.list(&task.remote_dir, task.force_refresh).await {
            Ok(entries) => {
                ctx.stats.dirs_listed.fetch_add(1, Ordering::Relaxed);
                debug!("从 [{}] 获取 {} 个条目", task.remote_dir, entries.len());
                process_entries(ctx, task, entries, permit).await;
            }
            Err(e) => {
                let err = StrmError::Enumeration {
                    path: task.remote_dir.clone(),
                    message: format!("{:#}", e),
                };
                warn!("{}", err);
                ctx.stats.dirs_failed.fetch_add(1, Ordering::Relaxed);
                ctx.stats.failed_dirs.lock().await.push(task.remote_dir);
            }
        }
    }
    .boxed()
}

/// 处理一个目录的列举结果，处理完毕后释放并发名额
async fn process_entries(
    ctx: Arc<ScanContext>,
    task: DirectoryTask,
    entries: Vec<RemoteEntry>,
    permit: OwnedSemaphorePermit,
) {
    for entry in entries {
        if entry.is_dir {
            if !task.recursive {
                continue;
            }
            let child = task.child(&entry.name);
            if ctx.is_processed(&child.remote_dir) {
                debug!("目录 [{}] 已处理，增量更新跳过", child.remote_dir);
                ctx.stats.dirs_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            debug!("发现目录 [{}]", child.remote_dir);
            ctx.tracker.spawn(expand(ctx.clone(), child));
            continue;
        }

        match ctx.filter.classify(&entry.name) {
            FileKind::Target => {
                let raw_url = format!(
                    "{}/d{}",
                    ctx.base_url,
                    join_remote(&task.remote_dir, &entry.name)
                );
                let strm = StrmEntry::from_remote(&entry.name, &task.local_dir, &task.remote_dir, raw_url);
                if ctx.tx.send(strm).await.is_err() {
                    debug!("输出通道已关闭，丢弃 [{}]", entry.name);
                    continue;
                }
                ctx.stats.strm_found.fetch_add(1, Ordering::Relaxed);
            }
            FileKind::SideAsset => ctx.download_asset(&task, &entry).await,
            FileKind::Ignored => {}
        }
    }

    drop(permit);
}

/// 扫描输出流，所有任务结束后关闭
pub struct ScanStream {
    inner: ReceiverStream<StrmEntry>,
    tracker: TaskTracker,
    stats: Arc<ScanStats>,
}

impl ScanStream {
    /// 等待所有任务结束并返回统计，未读取的结果被丢弃
    pub async fn finish(self) -> ScanSummary {
        drop(self.inner);
        self.tracker.wait().await;
        self.stats.snapshot().await
    }

    /// 读取全部结果，按指纹去重
    pub async fn collect_all(mut self) -> (HashMap<String, StrmEntry>, ScanSummary) {
        let mut strms = HashMap::new();
        while let Some(strm) = self.next().await {
            strms.insert(strm.fingerprint(), strm);
        }
        let summary = self.finish().await;
        info!(
            "扫描完成: {} 个 strm, {} 个目录, {} 个跳过, {} 个失败",
            strms.len(),
            summary.dirs_listed,
            summary.dirs_skipped,
            summary.dirs_failed
        );
        (strms, summary)
    }
}

impl Stream for ScanStream {
    type Item = StrmEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
