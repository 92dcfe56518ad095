//! 测试用的内存目录树

use super::{RemoteEntry, RemoteLister};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MemoryLister {
    base_url: String,
    dirs: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl MemoryLister {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            dirs: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 添加文件，自动补全所有父目录
    pub fn add_file(&self, path: &str, size: u64) {
        let raw_url = format!("{}/d{}", self.base_url, path);
        self.add_file_with_url(path, size, &raw_url);
    }

    /// 添加文件并指定下载地址
    pub fn add_file_with_url(&self, path: &str, size: u64, raw_url: &str) {
        let (dir, name) = split(path);
        self.ensure_dir(&dir);
        self.dirs
            .lock()
            .unwrap()
            .entry(dir)
            .or_default()
            .push(RemoteEntry {
                name,
                is_dir: false,
                size,
                raw_url: raw_url.to_string(),
            });
    }

    pub fn add_dir(&self, path: &str) {
        self.ensure_dir(path);
    }

    pub fn remove_file(&self, path: &str) {
        let (dir, name) = split(path);
        if let Some(entries) = self.dirs.lock().unwrap().get_mut(&dir) {
            entries.retain(|e| e.name != name);
        }
    }

    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn ensure_dir(&self, path: &str) {
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.contains_key(path) {
            return;
        }
        dirs.insert(path.to_string(), Vec::new());
        let mut current = path.to_string();
        while current != "/" && !current.is_empty() {
            let (parent, name) = split(&current);
            let siblings = dirs.entry(parent.clone()).or_default();
            if !siblings.iter().any(|e| e.is_dir && e.name == name) {
                siblings.push(RemoteEntry {
                    name,
                    is_dir: true,
                    size: 0,
                    raw_url: String::new(),
                });
            }
            current = parent;
        }
    }
}

fn split(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[async_trait]
impl RemoteLister for MemoryLister {
    async fn list(&self, path: &str, _force_refresh: bool) -> Result<Vec<RemoteEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.failing.lock().unwrap().contains(path) {
            Err(anyhow!("模拟列举失败: {}", path))
        } else {
            self.dirs
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("目录不存在: {}", path))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn name(&self) -> &str {
        "memory"
    }
}
