use crate::config::{Config, DirBinding, Endpoint};
use crate::core::comparator::{reconcile, UpdateMode};
use crate::core::filter::ExtFilter;
use crate::core::inventory::{find_strm_files, scan_local, under_roots};
use crate::core::scanner::{DirectoryTask, ScanConfig, ScanSummary, StrmScanner};
use crate::core::strm::{check_client, StrmEntry};
use crate::core::transfer::AssetDownloader;
use crate::db::RecordStore;
use crate::error::{StrmError, StrmResult};
use crate::storage::RemoteLister;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 要执行的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    /// 全量扫描并覆盖生成所有 strm
    FreshAll,
    Update(UpdateMode),
    /// 只重建数据库记录，不写文件
    UpdateDatabase,
}

impl std::fmt::Display for RunCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunCommand::FreshAll => write!(f, "fresh-all"),
            RunCommand::Update(mode) => write!(f, "update --mode {}", mode),
            RunCommand::UpdateDatabase => write!(f, "update-database"),
        }
    }
}

/// 运行结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// 远程扫描到的 strm 数量
    pub scanned: u64,
    pub unchanged: u64,
    pub added: u64,
    pub deleted: u64,
    /// 失败数：端点连接、目录列举、文件写入等
    pub failed: u64,
    /// 增量模式下跳过的目录
    pub skipped_dirs: u64,
    /// check 发现的无效 strm
    pub invalid: u64,
    pub assets_downloaded: u64,
}

impl RunSummary {
    fn absorb_scan(&mut self, scan: &ScanSummary) {
        self.failed += scan.dirs_failed + scan.assets_failed;
        self.skipped_dirs += scan.dirs_skipped;
        self.assets_downloaded += scan.assets_downloaded;
    }

    fn merge(&mut self, other: &RunSummary) {
        self.scanned += other.scanned;
        self.unchanged += other.unchanged;
        self.added += other.added;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.skipped_dirs += other.skipped_dirs;
        self.invalid += other.invalid;
        self.assets_downloaded += other.assets_downloaded;
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "扫描 {}, 未变 {}, 新增 {}, 删除 {}, 失败 {}, 跳过目录 {}, 无效 {}, 下载 {}",
            self.scanned,
            self.unchanged,
            self.added,
            self.deleted,
            self.failed,
            self.skipped_dirs,
            self.invalid,
            self.assets_downloaded
        )
    }
}

/// 一个端点的扫描结果
#[derive(Debug, Default)]
struct EndpointWalk {
    strms: HashMap<String, StrmEntry>,
    /// 列举失败的远程目录（含列举失败的根目录）
    failed_dirs: Vec<String>,
    roots: Vec<String>,
}

impl EndpointWalk {
    fn covers_failed(&self, remote_dir: &str) -> bool {
        under_roots(remote_dir, &self.failed_dirs)
    }
}

/// 同步引擎
pub struct SyncEngine {
    config: Arc<Config>,
    store: Arc<RecordStore>,
}

impl SyncEngine {
    pub fn new(config: Arc<Config>, store: Arc<RecordStore>) -> Self {
        Self { config, store }
    }

    /// 连接所有端点并执行命令，连接失败的端点被跳过
    pub async fn run(&self, command: RunCommand) -> StrmResult<RunSummary> {
        let mut listers = Vec::new();
        let mut unreachable = 0;
        for endpoint in &self.config.endpoints {
            match crate::storage::connect(endpoint, self.config.timeout).await {
                Ok(lister) => listers.push((endpoint.clone(), lister)),
                Err(e) => {
                    let err = StrmError::Connectivity {
                        endpoint: endpoint.base_url.clone(),
                        message: format!("{:#}", e),
                    };
                    error!("{}，跳过该端点", err);
                    unreachable += 1;
                }
            }
        }

        let mut summary = self.run_with(command, &listers).await?;
        summary.failed += unreachable;
        Ok(summary)
    }

    /// 用已连接的端点执行命令
    pub async fn run_with(
        &self,
        command: RunCommand,
        listers: &[(Endpoint, Arc<dyn RemoteLister>)],
    ) -> StrmResult<RunSummary> {
        let start = Instant::now();
        info!("开始执行 {}", command);

        let mut summary = RunSummary::default();
        match command {
            RunCommand::UpdateDatabase => {
                summary = self.update_database(listers).await?;
            }
            _ => {
                // 增量模式只在开始时读取一次已处理目录
                let processed = match command {
                    RunCommand::Update(UpdateMode::Local) => {
                        Some(Arc::new(self.store.load_processed().await?))
                    }
                    _ => None,
                };
                for (endpoint, lister) in listers {
                    let result = match command {
                        RunCommand::FreshAll => self.fresh_all(endpoint, lister.clone()).await,
                        RunCommand::Update(UpdateMode::Local) => {
                            self.update_local(endpoint, lister.clone(), processed.clone())
                                .await
                        }
                        _ => self.update_remote(endpoint, lister.clone()).await,
                    };
                    match result {
                        Ok(s) => {
                            info!("端点 {} 完成: {}", lister.name(), s);
                            summary.merge(&s);
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            error!("端点 {} 执行失败: {}", lister.name(), e);
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            "{} 完成，用时 {:.1}s: {}",
            command,
            start.elapsed().as_secs_f64(),
            summary
        );
        Ok(summary)
    }

    /// 全量扫描，覆盖写入每个 strm
    async fn fresh_all(
        &self,
        endpoint: &Endpoint,
        lister: Arc<dyn RemoteLister>,
    ) -> StrmResult<RunSummary> {
        let mut summary = RunSummary::default();
        let downloader = self.downloader(endpoint)?;
        let mut written = Vec::new();
        let mut incomplete = Vec::new();

        for (binding, task) in self.root_tasks(endpoint) {
            let root = task.remote_dir.clone();
            let scanner = StrmScanner::new(lister.clone(), self.scan_config(endpoint))
                .with_downloader(downloader.clone());
            let mut stream = match scanner.scan(task).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("{} ({})", e, binding.local_directory.display());
                    summary.failed += 1;
                    incomplete.push(root);
                    continue;
                }
            };

            while let Some(strm) = stream.next().await {
                summary.scanned += 1;
                match strm.create(true).await {
                    Ok(()) => written.push(strm),
                    Err(e) => {
                        warn!("生成 {} 失败: {}", strm.path().display(), e);
                        summary.failed += 1;
                        incomplete.push(strm.remote_dir.clone());
                    }
                }
            }
            let scan = stream.finish().await;
            summary.absorb_scan(&scan);
            incomplete.extend(scan.failed_dirs);
        }

        summary.added = written.len() as u64;
        self.store.put_fingerprints(&written).await?;
        self.store
            .mark_processed_batch(&markable_dirs(written.iter(), &incomplete))
            .await?;
        Ok(summary)
    }

    /// 增量更新，只补充本地缺少的 strm
    async fn update_local(
        &self,
        endpoint: &Endpoint,
        lister: Arc<dyn RemoteLister>,
        processed: Option<Arc<HashSet<String>>>,
    ) -> StrmResult<RunSummary> {
        let mut summary = RunSummary::default();
        let downloader = self.downloader(endpoint)?;
        let walk = self
            .walk(endpoint, lister, processed, Some(downloader), &mut summary)
            .await;

        let mut local = self.store.load_all().await?;
        for binding in self.bindings(endpoint) {
            local.extend(scan_local(&binding.local_directory).await?);
        }

        let result = reconcile(&local, &walk.strms, UpdateMode::Local);
        summary.unchanged = result.unchanged as u64;

        let mut added = Vec::new();
        let mut incomplete = walk.failed_dirs;
        for strm in result.to_add {
            match strm.create(false).await {
                Ok(()) => added.push(strm),
                Err(StrmError::AlreadyExists(path)) => {
                    warn!("FileConflict: {} 已存在，保留原文件", path.display());
                    summary.failed += 1;
                    incomplete.push(strm.remote_dir.clone());
                }
                Err(e) => {
                    warn!("生成 {} 失败: {}", strm.path().display(), e);
                    summary.failed += 1;
                    incomplete.push(strm.remote_dir.clone());
                }
            }
        }

        summary.added = added.len() as u64;
        self.store.put_fingerprints(&added).await?;
        self.store
            .mark_processed_batch(&markable_dirs(added.iter(), &incomplete))
            .await?;
        Ok(summary)
    }

    /// 以远程为准，删除远程已不存在的 strm
    async fn update_remote(
        &self,
        endpoint: &Endpoint,
        lister: Arc<dyn RemoteLister>,
    ) -> StrmResult<RunSummary> {
        let mut summary = RunSummary::default();
        let url_prefix = format!("{}/d/", lister.base_url().trim_end_matches('/'));
        let walk = self.walk(endpoint, lister, None, None, &mut summary).await;

        let mut local = self.store.load_all().await?;
        for binding in self.bindings(endpoint) {
            local.extend(scan_local(&binding.local_directory).await?);
        }
        // 只处理本端点本次扫描的根目录下的记录
        local.retain(|_, e| {
            e.raw_url.starts_with(&url_prefix) && under_roots(&e.remote_dir, &walk.roots)
        });

        let result = reconcile(&local, &walk.strms, UpdateMode::Remote);
        summary.unchanged = result.unchanged as u64;
        if !result.to_add.is_empty() {
            info!(
                "远程新增 {} 个文件，可用 update --mode local 生成",
                result.to_add.len()
            );
        }

        let mut touched = HashSet::new();
        for strm in result.to_delete {
            if walk.covers_failed(&strm.remote_dir) {
                debug!("[{}] 位于列举失败的目录下，保留", strm.path().display());
                continue;
            }
            match strm.delete(&self.store).await {
                Ok(()) => {
                    info!("已删除 {}", strm.path().display());
                    summary.deleted += 1;
                    touched.insert(strm.remote_dir.clone());
                }
                Err(e) => {
                    warn!("删除 {} 失败: {}", strm.path().display(), e);
                    summary.failed += 1;
                }
            }
        }

        // 不再有任何 strm 的目录取消已处理标记
        let remaining: HashSet<&str> = walk.strms.values().map(|e| e.remote_dir.as_str()).collect();
        for dir in touched {
            if !remaining.contains(dir.as_str()) {
                self.store.unmark_processed(&dir).await?;
            }
        }
        Ok(summary)
    }

    /// 全量扫描后整体替换数据库记录，不写文件
    async fn update_database(
        &self,
        listers: &[(Endpoint, Arc<dyn RemoteLister>)],
    ) -> StrmResult<RunSummary> {
        let mut summary = RunSummary::default();
        let mut records = HashMap::new();
        let mut failed_dirs = Vec::new();

        for (endpoint, lister) in listers {
            let walk = self
                .walk(endpoint, lister.clone(), None, None, &mut summary)
                .await;
            records.extend(walk.strms);
            failed_dirs.extend(walk.failed_dirs);
        }

        // 列举失败的目录保留原有记录
        if !failed_dirs.is_empty() {
            for (fingerprint, entry) in self.store.load_all().await? {
                if under_roots(&entry.remote_dir, &failed_dirs) {
                    records.entry(fingerprint).or_insert(entry);
                }
            }
        }
        let mut processed = markable_dirs(records.values(), &failed_dirs);
        // 失败目录之下原有的标记保留，失败目录本身及其上级不保留
        for dir in self.store.load_processed().await? {
            if under_roots(&dir, &failed_dirs) && !failed_dirs.contains(&dir) {
                processed.entry(dir).or_insert(0);
            }
        }

        summary.added = records.len() as u64;
        self.store.save_all(&records).await?;
        self.store.save_processed(&processed).await?;
        info!(
            "数据库已更新: {} 条记录, {} 个已处理目录",
            records.len(),
            processed.len()
        );
        Ok(summary)
    }

    /// 检查所有本地 strm 的播放地址，`remove` 时删除无效文件
    pub async fn check(&self, remove: bool) -> StrmResult<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();

        for endpoint in &self.config.endpoints {
            let client = check_client(self.config.timeout, endpoint.insecure_tls_verify)?;
            for binding in self.bindings(endpoint) {
                // 多个绑定共用一个本地目录时只检查一次
                if !seen.insert(binding.local_directory.clone()) {
                    continue;
                }
                let paths = find_strm_files(&binding.local_directory).await?;
                info!(
                    "检查 [{}] 下的 {} 个 strm",
                    binding.local_directory.display(),
                    paths.len()
                );

                let mut results = futures::stream::iter(paths)
                    .map(|path| {
                        let client = &client;
                        async move {
                            let entry = StrmEntry::read(&path).await?;
                            let valid = entry.validate(client).await;
                            Ok::<_, StrmError>((entry, valid))
                        }
                    })
                    .buffer_unordered(endpoint.max_connections.max(1));

                while let Some(result) = results.next().await {
                    summary.scanned += 1;
                    let (entry, valid) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("{}", e);
                            summary.failed += 1;
                            continue;
                        }
                    };
                    if valid {
                        summary.unchanged += 1;
                        continue;
                    }
                    summary.invalid += 1;
                    warn!("无效的 strm: {} -> {}", entry.path().display(), entry.raw_url);
                    if remove {
                        match entry.delete(&self.store).await {
                            Ok(()) => summary.deleted += 1,
                            Err(e) => {
                                warn!("删除 {} 失败: {}", entry.path().display(), e);
                                summary.failed += 1;
                            }
                        }
                    }
                }
            }
        }

        info!(
            "check 完成，用时 {:.1}s: {}",
            start.elapsed().as_secs_f64(),
            summary
        );
        Ok(summary)
    }

    /// 扫描端点下所有启用的目录绑定，结果合并
    async fn walk(
        &self,
        endpoint: &Endpoint,
        lister: Arc<dyn RemoteLister>,
        processed: Option<Arc<HashSet<String>>>,
        downloader: Option<AssetDownloader>,
        summary: &mut RunSummary,
    ) -> EndpointWalk {
        let mut walk = EndpointWalk::default();

        for (_, task) in self.root_tasks(endpoint) {
            walk.roots.push(task.remote_dir.clone());
            let root = task.remote_dir.clone();

            let mut scanner = StrmScanner::new(lister.clone(), self.scan_config(endpoint));
            if let Some(processed) = &processed {
                scanner = scanner.with_processed(processed.clone());
            }
            if let Some(downloader) = &downloader {
                scanner = scanner.with_downloader(downloader.clone());
            }

            match scanner.scan(task).await {
                Ok(stream) => {
                    let (strms, scan) = stream.collect_all().await;
                    summary.scanned += strms.len() as u64;
                    summary.absorb_scan(&scan);
                    walk.failed_dirs.extend(scan.failed_dirs);
                    walk.strms.extend(strms);
                }
                Err(e) => {
                    warn!("{}", e);
                    summary.failed += 1;
                    walk.failed_dirs.push(root);
                }
            }
        }

        walk
    }

    fn bindings<'a>(&self, endpoint: &'a Endpoint) -> impl Iterator<Item = &'a DirBinding> {
        endpoint.dirs.iter().filter(|binding| !binding.disabled)
    }

    /// 每个启用的绑定、每个远程目录对应一个根任务
    fn root_tasks<'a>(&self, endpoint: &'a Endpoint) -> Vec<(&'a DirBinding, DirectoryTask)> {
        let mut tasks = Vec::new();
        for binding in endpoint.dirs.iter().filter(|b| b.disabled) {
            info!("目录 [{}] 已禁用，跳过", binding.local_directory.display());
        }
        for binding in self.bindings(endpoint) {
            for remote in &binding.remote_directories {
                tasks.push((
                    binding,
                    DirectoryTask {
                        remote_dir: normalize_remote(remote),
                        local_dir: PathBuf::from(&binding.local_directory),
                        recursive: !binding.not_recursive,
                        create_sub_directory: self.config.create_sub_directory
                            || binding.create_sub_directory,
                        force_refresh: binding.force_refresh,
                    },
                ));
            }
        }
        tasks
    }

    fn scan_config(&self, endpoint: &Endpoint) -> ScanConfig {
        ScanConfig {
            max_concurrent: endpoint.max_connections,
            filter: ExtFilter::new(self.config.exts_for(endpoint), &self.config.alt_exts),
            ..Default::default()
        }
    }

    fn downloader(&self, endpoint: &Endpoint) -> StrmResult<AssetDownloader> {
        AssetDownloader::new(self.config.timeout, endpoint.insecure_tls_verify)
    }
}

/// 统一远程路径：以 / 开头，不以 / 结尾（根目录除外）
fn normalize_remote(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// 可以标记为已处理的目录及其 strm 数量
///
/// 目录自身或任一子目录出现列举失败、写入失败时不标记，
/// 否则增量更新会跳过其中未处理的文件。
fn markable_dirs<'a>(
    entries: impl Iterator<Item = &'a StrmEntry>,
    incomplete: &[String],
) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    for entry in entries {
        *counts.entry(entry.remote_dir.clone()).or_insert(0) += 1;
    }
    counts.retain(|dir, _| {
        !incomplete
            .iter()
            .any(|bad| under_roots(bad, std::slice::from_ref(dir)))
    });
    counts
}
