//! Federated query coordinator.
//!
//! One `Coordinator` owns every live query state; request handlers get a
//! reference to it instead of reaching into process globals. Per query it
//! fans out to all configured backends, ingests their result streams into
//! spill files, keeps a top-10 under a mutex, aggregates per-backend
//! progress, and — once every backend has completed — sorts the result
//! pointers and announces pagination. Waiters block on a notifier with an
//! explicit deadline; there are no polling loops.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as Atomic};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::backend::stream_results;
use crate::config::CoordinatorConfig;
use crate::events::{ErrorKind, Event};
use crate::spill::{
    ensure_headroom, fnv64a, sort_pointers, write_pointer_regions, ResultPointer, SpillFile,
};
use crate::stringpool::StringPool;

const TOP_RESULTS: usize = 10;

/// Newest-version selection hook. The default is plain string comparison,
/// a documented approximation that mis-orders numeric components ("10"
/// sorts before "9"); callers needing real package version ordering inject
/// their own.
pub type VersionCmp = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

pub struct Coordinator {
    cfg: CoordinatorConfig,
    version_cmp: VersionCmp,
    queries: Mutex<HashMap<String, Arc<QueryState>>>,
}

pub struct QueryState {
    pub id: String,
    pub query: String,
    started: Instant,
    dir: PathBuf,
    spills: Vec<SpillFile>,
    packages: StringPool,

    top: Mutex<TopList>,
    progress: Mutex<Progress>,
    pointers: Mutex<Vec<ResultPointer>>,
    by_package: Mutex<Vec<PackageResults>>,
    first_path_rank: Mutex<f64>,
    num_results: AtomicUsize,
    result_pages: AtomicUsize,

    finalized: AtomicBool,
    done: AtomicBool,
    done_at: Mutex<Option<Instant>>,
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

struct Progress {
    files_processed: Vec<u64>,
    /// `None` until the backend reports its total.
    files_total: Vec<Option<u64>>,
}

struct TopList {
    entries: Vec<TopEntry>,
}

#[derive(Debug, Clone)]
struct TopEntry {
    ranking: f32,
    path: String,
}

impl TopList {
    /// Insert if the result beats the current worst; keeps at most
    /// `TOP_RESULTS` entries, ordered by (ranking, path) descending.
    fn insert(&mut self, ranking: f32, path: &str) -> bool {
        if let Some(worst) = self.entries.last() {
            if self.entries.len() == TOP_RESULTS && ranking <= worst.ranking {
                return false;
            }
        }
        self.entries.push(TopEntry {
            ranking,
            path: path.to_string(),
        });
        self.entries
            .sort_by(|a, b| b.ranking.total_cmp(&a.ranking).then_with(|| b.path.cmp(&a.path)));
        self.entries.truncate(TOP_RESULTS);
        true
    }
}

/// Ranked results for one source package (newest version only).
#[derive(Debug, Clone)]
pub struct PackageResults {
    pub package: String,
    pub pointers: Vec<ResultPointer>,
}

#[derive(Debug, Clone)]
pub struct QueryStats {
    pub query: String,
    pub query_id: String,
    pub done: bool,
    pub age: Duration,
    pub num_events: usize,
    pub num_results: usize,
    pub result_pages: usize,
    pub files_processed: Vec<u64>,
    pub files_total: Vec<Option<u64>>,
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        self.done.load(Atomic::SeqCst)
    }

    pub fn num_results(&self) -> usize {
        self.num_results.load(Atomic::SeqCst)
    }

    pub fn result_pages(&self) -> usize {
        self.result_pages.load(Atomic::SeqCst)
    }

    pub fn results_dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Snapshot of the ranked per-package grouping (valid once done).
    pub fn packages(&self) -> Vec<PackageResults> {
        self.by_package.lock().clone()
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn emit(&self, event: Event) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }

    /// Wait for the event at index `since`, up to `deadline`. Returns
    /// `None` on timeout or when the query is done and no further events
    /// will come.
    pub async fn next_event(&self, since: usize, deadline: Duration) -> Option<Event> {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let notified = self.notify.notified();
            {
                let events = self.events.lock();
                if events.len() > since {
                    return Some(events[since].clone());
                }
                if self.is_done() {
                    return None;
                }
            }
            if tokio::time::timeout_at(end, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Wait until the query completes, up to `deadline`.
    pub async fn wait_done(&self, deadline: Duration) -> bool {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                return true;
            }
            if tokio::time::timeout_at(end, notified).await.is_err() {
                return self.is_done();
            }
        }
    }
}

impl Coordinator {
    pub fn new(cfg: CoordinatorConfig) -> Arc<Self> {
        Self::with_version_cmp(cfg, Arc::new(|a: &str, b: &str| a.cmp(b)))
    }

    pub fn with_version_cmp(cfg: CoordinatorConfig, version_cmp: VersionCmp) -> Arc<Self> {
        Arc::new(Coordinator {
            cfg,
            version_cmp,
            queries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    /// Stable id for a query string.
    pub fn query_id(query: &str) -> String {
        let mut h = fnv::FnvHasher::default();
        h.write(query.trim().as_bytes());
        format!("{:016x}", h.finish())
    }

    /// Start (or join) the query for `raw_query`. An existing state younger
    /// than the staleness threshold is reused; otherwise completed states
    /// are garbage-collected oldest-done-first and a fresh fan-out begins.
    pub fn start_query(self: &Arc<Self>, raw_query: &str) -> Result<Arc<QueryState>> {
        let query = raw_query.trim().to_string();
        if query.is_empty() {
            bail!("empty query");
        }
        if self.cfg.backends.is_empty() {
            bail!("no backends configured");
        }
        let id = Self::query_id(&query);

        let mut queries = self.queries.lock();
        if let Some(qs) = queries.get(&id) {
            if qs.started.elapsed() < self.cfg.staleness {
                return Ok(qs.clone());
            }
            queries.remove(&id);
        }
        if queries.len() >= self.cfg.max_live_queries {
            let mut done: Vec<(String, Instant)> = queries
                .iter()
                .filter_map(|(k, v)| (*v.done_at.lock()).map(|t| (k.clone(), t)))
                .collect();
            done.sort_by_key(|(_, t)| *t);
            for (k, _) in done {
                if queries.len() < self.cfg.max_live_queries {
                    break;
                }
                tracing::info!(id = %k, "garbage-collecting completed query");
                queries.remove(&k);
            }
        }

        let dir = self.cfg.results_root.join(&id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create query results dir {}", dir.display()))?;
        ensure_headroom(&self.cfg.results_root, self.cfg.headroom_fraction)?;

        let n = self.cfg.backends.len();
        let mut spills = Vec::with_capacity(n);
        for i in 0..n {
            spills.push(SpillFile::create(dir.join(format!("unsorted_{}.json", i)))?);
        }
        let qs = Arc::new(QueryState {
            id: id.clone(),
            query,
            started: Instant::now(),
            dir,
            spills,
            packages: StringPool::new(),
            top: Mutex::new(TopList {
                entries: Vec::new(),
            }),
            progress: Mutex::new(Progress {
                files_processed: vec![0; n],
                files_total: vec![None; n],
            }),
            pointers: Mutex::new(Vec::new()),
            by_package: Mutex::new(Vec::new()),
            first_path_rank: Mutex::new(0.0),
            num_results: AtomicUsize::new(0),
            result_pages: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            done: AtomicBool::new(false),
            done_at: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        queries.insert(id, qs.clone());
        drop(queries);

        tracing::info!(id = %qs.id, query = %qs.query, "starting query");
        for (idx, addr) in self.cfg.backends.iter().enumerate() {
            tokio::spawn(run_backend(
                self.clone(),
                qs.clone(),
                idx,
                addr.clone(),
            ));
        }
        Ok(qs)
    }

    pub fn get_query(&self, id: &str) -> Option<Arc<QueryState>> {
        self.queries.lock().get(id).cloned()
    }

    /// Cancel a running query: emits a `cancelled` error event and marks the
    /// query done so backend ingest stops.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get_query(id) {
            None => false,
            Some(qs) => {
                qs.emit(Event::Error {
                    error_type: ErrorKind::Cancelled,
                });
                self.finish_query(&qs);
                true
            }
        }
    }

    pub fn query_stats(&self) -> Vec<QueryStats> {
        let queries = self.queries.lock();
        let mut stats: Vec<QueryStats> = queries
            .values()
            .map(|qs| {
                let progress = qs.progress.lock();
                QueryStats {
                    query: qs.query.clone(),
                    query_id: qs.id.clone(),
                    done: qs.is_done(),
                    age: qs.started.elapsed(),
                    num_events: qs.events.lock().len(),
                    num_results: qs.num_results(),
                    result_pages: qs.result_pages(),
                    files_processed: progress.files_processed.clone(),
                    files_total: progress.files_total.clone(),
                }
            })
            .collect();
        stats.sort_by_key(|s| s.age);
        stats
    }

    fn handle_message(&self, qs: &Arc<QueryState>, idx: usize, v: Value) -> Result<()> {
        // The backends send results without a Type, so that is the default.
        let typ = v
            .get("Type")
            .and_then(Value::as_str)
            .unwrap_or("result")
            .to_string();
        match typ.as_str() {
            "result" => self.store_result(qs, idx, v),
            "progress" => {
                let processed = v.get("FilesProcessed").and_then(Value::as_u64).unwrap_or(0);
                let total = v.get("FilesTotal").and_then(Value::as_u64).unwrap_or(0);
                self.store_progress(qs, idx, processed, total);
                Ok(())
            }
            other => {
                tracing::debug!(id = %qs.id, msg_type = %other, "ignoring unknown message");
                Ok(())
            }
        }
    }

    fn store_result(&self, qs: &Arc<QueryState>, idx: usize, mut v: Value) -> Result<()> {
        let path = v
            .get("Path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("result without Path"))?
            .to_string();
        let package = match path.split_once('/') {
            Some((pkg, _)) => pkg.to_string(),
            None => bail!("result path {:?} has no package component", path),
        };
        let path_rank = v.get("PathRank").and_then(Value::as_f64).unwrap_or(0.0);
        let content_rank = v.get("Ranking").and_then(Value::as_f64).unwrap_or(0.0);

        // Blend path rank (pre-verification) and content rank
        // (post-verification). The first observed path rank stands in for
        // the maximum, which would only be known after the last result.
        let ranking = {
            let mut first = qs.first_path_rank.lock();
            if *first > 0.0 {
                path_rank + (*first * 0.1) * content_rank
            } else {
                *first = path_rank;
                content_rank
            }
        };

        let obj = v
            .as_object_mut()
            .ok_or_else(|| anyhow!("result is not a JSON object"))?;
        obj.insert("Type".to_string(), json!("result"));
        obj.insert("Package".to_string(), json!(package));
        obj.insert("Ranking".to_string(), json!(ranking));

        let mut bytes = serde_json::to_vec(&v)?;
        bytes.push(b'\n');
        let (offset, length) = qs.spills[idx].append(&bytes)?;

        qs.pointers.lock().push(ResultPointer {
            backend_idx: idx,
            ranking: ranking as f32,
            offset,
            length,
            path_hash: fnv64a(path.as_bytes()),
            package: qs.packages.get(&package),
        });
        qs.num_results.fetch_add(1, Atomic::SeqCst);

        let entered = qs.top.lock().insert(ranking as f32, &path);
        if entered {
            // It made the top-10: stream it to listeners right away.
            qs.emit(Event::Result(v));
        }
        Ok(())
    }

    fn store_progress(&self, qs: &Arc<QueryState>, idx: usize, processed: u64, total: u64) {
        let (all_set, sum_processed, sum_total) = {
            let mut p = qs.progress.lock();
            p.files_total[idx] = Some(total);
            p.files_processed[idx] = processed;
            let all_set = p.files_total.iter().all(Option::is_some);
            (
                all_set,
                p.files_processed.iter().sum::<u64>(),
                p.files_total.iter().map(|t| t.unwrap_or(0)).sum::<u64>(),
            )
        };

        if all_set && sum_processed == sum_total && !qs.is_done() {
            if let Err(e) = self.finalize(qs) {
                tracing::error!(id = %qs.id, error = %e, "failed to write results");
                self.fail_query(qs);
                return;
            }
        }
        if all_set {
            qs.emit(Event::Progress {
                query_id: qs.id.clone(),
                files_processed: sum_processed,
                files_total: sum_total,
                results: qs.num_results(),
            });
            if sum_processed == sum_total {
                self.finish_query(qs);
            }
        } else {
            tracing::debug!(id = %qs.id, backend = idx, processed, total, "progress");
        }
    }

    /// Sort pointers, compute pagination, and group the newest version of
    /// each package. Runs once per query.
    fn finalize(&self, qs: &Arc<QueryState>) -> Result<()> {
        if qs.finalized.swap(true, Atomic::SeqCst) {
            return Ok(());
        }
        let mut pointers = qs.pointers.lock().clone();
        if pointers.is_empty() {
            tracing::info!(id = %qs.id, "query finished without results");
            return Ok(());
        }

        // Newest version of each source package, per the comparator hook.
        let mut best_version: HashMap<String, String> = HashMap::new();
        for p in &pointers {
            let (name, version) = split_package(&p.package);
            match best_version.get(name) {
                Some(cur) if (self.version_cmp)(version, cur) != Ordering::Greater => {}
                _ => {
                    best_version.insert(name.to_string(), version.to_string());
                }
            }
        }

        let sort_started = Instant::now();
        sort_pointers(&mut pointers);
        tracing::debug!(
            id = %qs.id,
            results = pointers.len(),
            elapsed = ?sort_started.elapsed(),
            "pointer sorting done"
        );

        ensure_headroom(&self.cfg.results_root, self.cfg.headroom_fraction)?;

        let pages = pointers.len().div_ceil(self.cfg.results_per_page);

        let mut by_package: Vec<PackageResults> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        for p in &pointers {
            let (name, version) = split_package(&p.package);
            if best_version.get(name).map(String::as_str) != Some(version) {
                continue;
            }
            let i = *index_of.entry(name.to_string()).or_insert_with(|| {
                by_package.push(PackageResults {
                    package: name.to_string(),
                    pointers: Vec::new(),
                });
                by_package.len() - 1
            });
            if by_package[i].pointers.len() < self.cfg.results_per_package {
                by_package[i].pointers.push(p.clone());
            }
        }

        *qs.pointers.lock() = pointers;
        *qs.by_package.lock() = by_package;
        qs.result_pages.store(pages, Atomic::SeqCst);
        if pages > 0 {
            qs.emit(Event::Pagination {
                query_id: qs.id.clone(),
                result_pages: pages,
            });
        }
        Ok(())
    }

    fn fail_query(&self, qs: &Arc<QueryState>) {
        qs.emit(Event::Error {
            error_type: ErrorKind::Failed,
        });
        self.finish_query(qs);
    }

    fn finish_query(&self, qs: &Arc<QueryState>) {
        if qs.done.swap(true, Atomic::SeqCst) {
            return;
        }
        *qs.done_at.lock() = Some(Instant::now());
        qs.notify.notify_waiters();
        tracing::info!(id = %qs.id, results = qs.num_results(), "query done");
    }

    /// Write `page_<n>.json` by splicing spill regions; the query must be
    /// finalized.
    pub fn write_result_page(&self, qs: &QueryState, page: usize) -> Result<PathBuf> {
        ensure_headroom(&self.cfg.results_root, self.cfg.headroom_fraction)?;
        let pointers = qs.pointers.lock();
        let start = page * self.cfg.results_per_page;
        if start >= pointers.len() {
            bail!("page {} out of range ({} results)", page, pointers.len());
        }
        let end = (start + self.cfg.results_per_page).min(pointers.len());
        let path = qs.dir.join(format!("page_{}.json", page));
        let mut out = BufWriter::new(File::create(&path)?);
        write_pointer_regions(&mut out, &qs.spills, &pointers[start..end])?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(path)
    }

    /// Write `perpackage_<rpp>_page_<n>.json`: an array of
    /// `{Package, Results: [...]}` objects.
    pub fn write_per_package_page(&self, qs: &QueryState, page: usize) -> Result<PathBuf> {
        ensure_headroom(&self.cfg.results_root, self.cfg.headroom_fraction)?;
        let by_package = qs.by_package.lock();
        let start = page * self.cfg.packages_per_page;
        if start >= by_package.len() {
            bail!("per-package page {} out of range", page);
        }
        let end = (start + self.cfg.packages_per_page).min(by_package.len());
        let path = qs.dir.join(format!(
            "perpackage_{}_page_{}.json",
            self.cfg.results_per_package, page
        ));
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(b"[")?;
        for (i, pkg) in by_package[start..end].iter().enumerate() {
            if i > 0 {
                out.write_all(b",")?;
            }
            write!(out, "{{\"Package\":{},\"Results\":", json!(pkg.package))?;
            write_pointer_regions(&mut out, &qs.spills, &pkg.pointers)?;
            out.write_all(b"}")?;
        }
        out.write_all(b"]\n")?;
        out.flush()?;
        Ok(path)
    }
}

fn split_package(pkg: &str) -> (&str, &str) {
    match pkg.split_once('_') {
        Some((name, version)) => (name, version),
        None => (pkg, ""),
    }
}

async fn run_backend(coord: Arc<Coordinator>, qs: Arc<QueryState>, idx: usize, addr: String) {
    let request = match serde_json::to_vec(&json!({
        "Query": qs.query,
        "URL": format!("?q={}", urlencoding::encode(&qs.query)),
    })) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(id = %qs.id, error = %e, "encode query");
            return;
        }
    };

    let res = stream_results(
        &addr,
        &request,
        coord.cfg.connect_timeout,
        coord.cfg.read_deadline,
        || qs.is_done(),
        |v| coord.handle_message(&qs, idx, v),
    )
    .await;
    match res {
        Ok(()) => tracing::debug!(id = %qs.id, backend = %addr, "backend stream closed"),
        Err(e) => tracing::warn!(id = %qs.id, backend = %addr, error = %e, "backend failed"),
    }

    // The backend is gone (or the stream broke) without completing: report
    // full progress on its behalf so the query can finalize, and tell the
    // clients the results are partial.
    let (processed, total) = {
        let p = qs.progress.lock();
        (p.files_processed[idx], p.files_total[idx])
    };
    let complete = matches!(total, Some(t) if processed == t);
    if !complete && !qs.is_done() {
        let t = total.unwrap_or(0);
        coord.store_progress(&qs, idx, t, t);
        qs.emit(Event::Error {
            error_type: ErrorKind::BackendUnavailable,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_ids_are_stable_and_canonicalized() {
        let a = Coordinator::query_id("foobar");
        let b = Coordinator::query_id("  foobar ");
        let c = Coordinator::query_id("foobaz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn package_splitting() {
        assert_eq!(split_package("i3-wm_4.16.1-1"), ("i3-wm", "4.16.1-1"));
        assert_eq!(split_package("noversion"), ("noversion", ""));
    }

    #[test]
    fn top_list_keeps_ten_best() {
        let mut top = TopList {
            entries: Vec::new(),
        };
        for i in 0..20 {
            top.insert(i as f32, &format!("path{}", i));
        }
        assert_eq!(top.entries.len(), TOP_RESULTS);
        assert_eq!(top.entries[0].ranking, 19.0);
        // Too weak to enter.
        assert!(!top.insert(0.5, "weak"));
        // Tie with the worst does not enter either.
        let worst = top.entries.last().unwrap().ranking;
        assert!(!top.insert(worst, "tie"));
    }
}
