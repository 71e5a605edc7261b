use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{Finder, ScanError};

/// What happens to an installed object when its file disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Keep serving the last successfully loaded version.
    #[default]
    RetainLastKnownGood,
    /// Unregister everything the file provided.
    Purge,
}

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub loaded: Vec<PathBuf>,
    pub replaced: Vec<PathBuf>,
    /// Candidates that were unchanged since they were last loaded or failed.
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub removed: Vec<PathBuf>,
    pub postponed: Vec<PathBuf>,
}

impl CycleReport {
    pub fn changed(&self) -> bool {
        !(self.loaded.is_empty() && self.replaced.is_empty() && self.removed.is_empty())
    }
}

#[derive(Default)]
struct LoopState {
    /// Modification time of every successfully loaded file.
    loaded: HashMap<PathBuf, SystemTime>,
    /// Modification time at which a file last failed; retried once it changes.
    failed: HashMap<PathBuf, SystemTime>,
    /// (file, message) pairs already logged at warn level.
    reported: HashSet<(PathBuf, String)>,
}

/// Polls a [`Finder`]'s directory and keeps its installed objects in sync.
///
/// Cloning is cheap and clones share state, so a restarted loop thread picks
/// up where the previous one stopped.
#[derive(Clone)]
pub struct DiscoveryLoop {
    finder: Arc<dyn Finder>,
    policy: RemovalPolicy,
    state: Arc<Mutex<LoopState>>,
}

impl DiscoveryLoop {
    pub fn new(finder: Arc<dyn Finder>) -> Self {
        Self {
            finder,
            policy: RemovalPolicy::default(),
            state: Arc::new(Mutex::new(LoopState::default())),
        }
    }

    pub fn with_policy(mut self, policy: RemovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> String {
        self.finder.name()
    }

    pub fn policy(&self) -> RemovalPolicy {
        self.policy
    }

    /// Runs a single discovery cycle.
    pub fn run_once(&self) -> CycleReport {
        let mut state = self.state.lock();
        let mut report = CycleReport::default();
        let candidates = self.candidates();
        let present: HashSet<&PathBuf> = candidates.iter().map(|(path, _)| path).collect();

        let gone: Vec<PathBuf> = state
            .loaded
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        for path in gone {
            state.loaded.remove(&path);
            match self.policy {
                RemovalPolicy::Purge => {
                    let dropped = self.finder.forget(&path);
                    info!(path = %path.display(), ?dropped, "archive removed, bindings purged");
                }
                RemovalPolicy::RetainLastKnownGood => {
                    info!(path = %path.display(), "archive removed, keeping last loaded version");
                }
            }
            report.removed.push(path);
        }
        state.failed.retain(|path, _| present.contains(path));

        let mut waiting = Vec::new();
        for (path, modified) in &candidates {
            let unchanged = state.loaded.get(path) == Some(modified)
                || state.failed.get(path) == Some(modified);
            if unchanged {
                report.skipped += 1;
                continue;
            }
            self.try_load(&mut state, &mut report, &mut waiting, path, *modified);
        }

        // Anything loaded this cycle may satisfy a postponed candidate.
        let mut progress = !waiting.is_empty() && report.changed();
        while progress {
            let before = report.loaded.len() + report.replaced.len();
            let retry = std::mem::take(&mut waiting);
            for (path, modified) in retry {
                self.try_load(&mut state, &mut report, &mut waiting, &path, modified);
            }
            progress =
                !waiting.is_empty() && report.loaded.len() + report.replaced.len() > before;
        }
        report.postponed = waiting.into_iter().map(|(path, _)| path).collect();

        if report.changed() || !report.failed.is_empty() {
            debug!(
                finder = %self.finder.name(),
                loaded = report.loaded.len(),
                replaced = report.replaced.len(),
                failed = report.failed.len(),
                removed = report.removed.len(),
                postponed = report.postponed.len(),
                "discovery cycle finished"
            );
        }
        report
    }

    fn try_load(
        &self,
        state: &mut LoopState,
        report: &mut CycleReport,
        waiting: &mut Vec<(PathBuf, SystemTime)>,
        path: &Path,
        modified: SystemTime,
    ) {
        let replacing = state.loaded.contains_key(path);
        match self.finder.load(path) {
            Ok(names) => {
                state.loaded.insert(path.to_path_buf(), modified);
                state.failed.remove(path);
                debug!(path = %path.display(), ?names, replacing, "loaded");
                if replacing {
                    report.replaced.push(path.to_path_buf());
                } else {
                    report.loaded.push(path.to_path_buf());
                }
            }
            Err(err) if err.is_postponed() => {
                self.log_failure(state, path, &err, true);
                waiting.push((path.to_path_buf(), modified));
            }
            Err(err) => {
                self.log_failure(state, path, &err, false);
                state.failed.insert(path.to_path_buf(), modified);
                report.failed.push((path.to_path_buf(), err.to_string()));
            }
        }
    }

    fn log_failure(&self, state: &mut LoopState, path: &Path, err: &ScanError, postponed: bool) {
        let message = err.to_string();
        let first = state.reported.insert((path.to_path_buf(), message.clone()));
        if first && !postponed {
            warn!(
                finder = %self.finder.name(),
                path = %path.display(),
                error = %message,
                "failed to load"
            );
        } else {
            debug!(
                finder = %self.finder.name(),
                path = %path.display(),
                error = %message,
                "failed to load"
            );
        }
    }

    fn candidates(&self) -> Vec<(PathBuf, SystemTime)> {
        let root = self.finder.root();
        if !root.exists() {
            return Vec::new();
        }
        let mut found = BTreeSet::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(root = %root.display(), %err, "skipping entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.finder.matches(entry.path()) {
                continue;
            }
            match entry.metadata().map(|meta| meta.modified()) {
                Ok(Ok(modified)) => {
                    found.insert((entry.into_path(), modified));
                }
                Ok(Err(err)) => debug!(%err, "no modification time"),
                Err(err) => debug!(%err, "no metadata"),
            }
        }
        found.into_iter().collect()
    }

    /// Starts a thread running a cycle every `interval` until stopped.
    pub fn spawn(&self, interval: Duration) -> DiscoveryHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cycles = Arc::new(AtomicU64::new(0));
        let discovery = self.clone();
        let counter = Arc::clone(&cycles);
        let name = self.name();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || loop {
            discovery.run_once();
            counter.fetch_add(1, Ordering::SeqCst);
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(%name, %err, "failed to start discovery thread");
                None
            }
        };
        DiscoveryHandle {
            name,
            stop: Some(stop_tx),
            thread,
            cycles,
        }
    }
}

/// Running discovery thread.
pub struct DiscoveryHandle {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    cycles: Arc<AtomicU64>,
}

impl DiscoveryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed cycles so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// True once the thread has exited, normally or by panic.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(name = %self.name, "discovery thread panicked");
            }
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    /// Loads `*.txt` files; a file containing "fail" fails and one containing
    /// "wait:<other>" is postponed until `<other>` has been loaded.
    struct TextFinder {
        root: PathBuf,
        installed: Mutex<Vec<String>>,
        loads: AtomicUsize,
    }

    impl TextFinder {
        fn new(root: &Path) -> Arc<Self> {
            Arc::new(Self {
                root: root.to_path_buf(),
                installed: Mutex::new(Vec::new()),
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl Finder for TextFinder {
        fn name(&self) -> String {
            "TextFinderThread".into()
        }

        fn root(&self) -> &Path {
            &self.root
        }

        fn matches(&self, path: &Path) -> bool {
            path.extension().is_some_and(|ext| ext == "txt")
        }

        fn load(&self, path: &Path) -> Result<Vec<String>, ScanError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let contents = fs::read_to_string(path).map_err(|source| ScanError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let name = path.file_stem().unwrap().to_string_lossy().into_owned();
            if contents.contains("fail") {
                return Err(ScanError::Invalid {
                    path: path.to_path_buf(),
                    message: "broken".into(),
                });
            }
            if let Some(other) = contents.strip_prefix("wait:") {
                if !self.installed.lock().iter().any(|n| n == other.trim()) {
                    return Err(clusteval_plugin_host::LoadError::Unsatisfied {
                        missing: Vec::new(),
                    }
                    .into());
                }
            }
            let mut installed = self.installed.lock();
            if !installed.contains(&name) {
                installed.push(name.clone());
            }
            Ok(vec![name])
        }

        fn forget(&self, path: &Path) -> Vec<String> {
            let name = path.file_stem().unwrap().to_string_lossy().into_owned();
            self.installed.lock().retain(|n| n != &name);
            vec![name]
        }
    }

    fn touch(path: &Path, contents: &str, secs: u64) {
        fs::write(path, contents).unwrap();
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn unchanged_files_are_skipped() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.txt"), "a", 1_000);
        touch(&dir.path().join("ignored.bin"), "x", 1_000);
        let finder = TextFinder::new(dir.path());
        let discovery = DiscoveryLoop::new(finder.clone());

        let first = discovery.run_once();
        assert_eq!(first.loaded, vec![dir.path().join("a.txt")]);
        let second = discovery.run_once();
        assert_eq!(second.skipped, 1);
        assert!(!second.changed());
        assert_eq!(finder.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn newer_timestamp_triggers_replacement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        touch(&path, "a", 1_000);
        let discovery = DiscoveryLoop::new(TextFinder::new(dir.path()));
        discovery.run_once();

        touch(&path, "a", 2_000);
        let report = discovery.run_once();
        assert_eq!(report.replaced, vec![path]);
        assert!(report.loaded.is_empty());
    }

    #[test]
    fn failures_are_retried_only_after_a_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        touch(&path, "fail", 1_000);
        let finder = TextFinder::new(dir.path());
        let discovery = DiscoveryLoop::new(finder.clone());

        assert_eq!(discovery.run_once().failed.len(), 1);
        assert_eq!(discovery.run_once().skipped, 1);
        assert_eq!(finder.loads.load(Ordering::SeqCst), 1);

        touch(&path, "fixed", 2_000);
        assert_eq!(discovery.run_once().loaded, vec![path]);
    }

    #[test]
    fn postponed_candidates_load_once_requirement_appears() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a_child.txt"), "wait:z_parent", 1_000);
        let finder = TextFinder::new(dir.path());
        let discovery = DiscoveryLoop::new(finder.clone());

        let report = discovery.run_once();
        assert_eq!(report.postponed, vec![dir.path().join("a_child.txt")]);
        assert!(report.failed.is_empty());

        touch(&dir.path().join("z_parent.txt"), "root", 1_000);
        let report = discovery.run_once();
        assert_eq!(report.loaded.len(), 2);
        assert!(report.postponed.is_empty());
    }

    #[test]
    fn removal_retains_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        touch(&path, "a", 1_000);
        let finder = TextFinder::new(dir.path());
        let discovery = DiscoveryLoop::new(finder.clone());
        discovery.run_once();

        fs::remove_file(&path).unwrap();
        let report = discovery.run_once();
        assert_eq!(report.removed, vec![path]);
        assert_eq!(*finder.installed.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn removal_purges_when_configured() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        touch(&path, "a", 1_000);
        let finder = TextFinder::new(dir.path());
        let discovery = DiscoveryLoop::new(finder.clone()).with_policy(RemovalPolicy::Purge);
        discovery.run_once();

        fs::remove_file(&path).unwrap();
        discovery.run_once();
        assert!(finder.installed.lock().is_empty());
    }

    #[test]
    fn spawned_loop_stops_promptly() {
        let dir = tempdir().unwrap();
        let discovery = DiscoveryLoop::new(TextFinder::new(dir.path()));
        let handle = discovery.spawn(Duration::from_secs(3600));
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.cycles() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.cycles(), 1);
        let started = Instant::now();
        handle.join();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
