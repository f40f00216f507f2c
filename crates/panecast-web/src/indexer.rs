//! Background filename index over the configured roots. Rescans on an
//! interval; queries are case-insensitive multi-term substring matches
//! scored toward basename and exact-name hits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

const SKIP_DIRS: [&str; 6] = [
    "node_modules",
    "__pycache__",
    "venv",
    "dist",
    "build",
    "target",
];

pub struct FileIndexer {
    roots: Vec<PathBuf>,
    interval: Duration,
    paths: RwLock<Vec<String>>,
}

impl FileIndexer {
    pub fn new(roots: Vec<PathBuf>, interval: Duration) -> Self {
        Self {
            roots,
            interval,
            paths: RwLock::new(Vec::new()),
        }
    }

    /// Rescan on a tick until cancelled; the first scan runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let indexer = Arc::clone(&self);
                    let _ = tokio::task::spawn_blocking(move || indexer.scan()).await;
                }
            }
        }
    }

    pub fn scan(&self) {
        let start = Instant::now();
        let mut paths = Vec::new();
        for root in &self.roots {
            walk(root, root, &mut paths);
        }
        let count = paths.len();
        *self.paths.write().expect("index lock poisoned") = paths;
        info!(
            files = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "file index updated"
        );
    }

    pub fn count(&self) -> usize {
        self.paths.read().expect("index lock poisoned").len()
    }

    /// Paths matching every whitespace-separated term, best matches first:
    /// exact filenames, then filename hits, then shorter paths.
    pub fn search(&self, query: &str, limit: usize) -> Vec<String> {
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }

        let paths = self.paths.read().expect("index lock poisoned");
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        let mut matches: Vec<(i64, &String)> = paths
            .iter()
            .filter_map(|path| {
                let path_lower = path.to_lowercase();
                if !terms.iter().all(|term| path_lower.contains(term)) {
                    return None;
                }
                // Lower scores first.
                let mut score = path.len() as i64;
                let base = Path::new(path)
                    .file_name()
                    .map(|b| b.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if base.contains(&query_lower) {
                    score -= 1000;
                }
                if base == query_lower {
                    score -= 2000;
                }
                Some((score, path))
            })
            .collect();

        matches.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        matches
            .into_iter()
            .take(limit)
            .map(|(_, path)| path.clone())
            .collect()
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(root, &entry.path(), out);
        } else if file_type.is_file() {
            if let Ok(rel) = entry.path().strip_prefix(root) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(dir: &Path) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::create_dir_all(dir.join("node_modules/lib")).unwrap();
        fs::create_dir_all(dir.join(".git")).unwrap();
        fs::write(dir.join("readme.md"), "x").unwrap();
        fs::write(dir.join("src/main.rs"), "x").unwrap();
        fs::write(dir.join("src/main_helpers.rs"), "x").unwrap();
        fs::write(dir.join("node_modules/lib/main.rs"), "x").unwrap();
        fs::write(dir.join(".git/config"), "x").unwrap();
        fs::write(dir.join(".hidden"), "x").unwrap();
    }

    fn indexed(dir: &Path) -> FileIndexer {
        let indexer = FileIndexer::new(vec![dir.to_path_buf()], Duration::from_secs(3600));
        indexer.scan();
        indexer
    }

    #[test]
    fn scan_skips_hidden_and_dependency_dirs() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let indexer = indexed(dir.path());

        assert_eq!(indexer.count(), 3);
        let all = indexer.search("r", 100);
        assert!(all.iter().all(|p| !p.contains("node_modules")));
        assert!(all.iter().all(|p| !p.contains(".git")));
    }

    #[test]
    fn exact_filename_outranks_substring_matches() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let indexer = indexed(dir.path());

        let results = indexer.search("main.rs", 10);
        assert_eq!(results.first().map(String::as_str), Some("src/main.rs"));
        assert!(results.contains(&"src/main_helpers.rs".to_string()));
    }

    #[test]
    fn all_terms_must_match() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let indexer = indexed(dir.path());

        assert_eq!(indexer.search("src helpers", 10).len(), 1);
        assert!(indexer.search("src nothing-here", 10).is_empty());
    }

    #[test]
    fn empty_query_and_zero_limit_return_nothing() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let indexer = indexed(dir.path());

        assert!(indexer.search("", 10).is_empty());
        assert!(indexer.search("main", 0).is_empty());
    }
}
