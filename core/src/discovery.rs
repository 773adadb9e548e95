//! File discovery: find new monitoring files under the source root.
//!
//! Discovery is stateless between scans; the dedupe set is the
//! `monitoring_files` table itself, keyed by content hash. A file that
//! is renamed or re-delivered with identical bytes is not discovered
//! twice. Candidates whose header cannot be read are skipped with a
//! warning and will be reconsidered on the next scan.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use dqmflow_protocol::MonitoringFile;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{DqmError, Result};
use crate::extract;
use crate::index::store::IndexStore;

#[derive(Clone)]
pub struct FileDiscovery {
    store: IndexStore,
    root: PathBuf,
    extension: String,
}

impl FileDiscovery {
    pub fn new(store: IndexStore, config: &Config) -> FileDiscovery {
        FileDiscovery {
            store,
            root: config.source_root.clone(),
            extension: config.scan_extension.clone(),
        }
    }

    /// Walk the source root and record unseen files as `Discovered`.
    ///
    /// Returns only the files this scan added. The walk order is
    /// sorted by file name so repeated scans over the same tree insert
    /// in a stable order.
    pub fn scan(&self) -> Result<Vec<MonitoringFile>> {
        if !self.root.is_dir() {
            return Err(DqmError::SourceUnavailable {
                path: self.root.display().to_string(),
                reason: "source root is not a readable directory".to_string(),
            });
        }

        let mut discovered = Vec::new();
        let mut candidates = 0usize;
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.matches_extension(entry.path()) {
                continue;
            }
            candidates += 1;
            match self.ingest(entry.path()) {
                Ok(Some(file)) => discovered.push(file),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "skipping candidate");
                }
            }
        }

        tracing::info!(
            root = %self.root.display(),
            candidates,
            new = discovered.len(),
            "scan complete"
        );
        Ok(discovered)
    }

    pub async fn scan_async(&self) -> Result<Vec<MonitoringFile>> {
        let discovery = self.clone();
        tokio::task::spawn_blocking(move || discovery.scan())
            .await
            .map_err(|e| DqmError::Worker(format!("scan join: {e}")))?
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == self.extension)
    }

    fn ingest(&self, path: &Path) -> Result<Option<MonitoringFile>> {
        let hash = hash_file(path)?;
        let header = extract::read_header(path)?;
        let size = path.metadata()?.len();
        let file = self.store.record_discovered(
            &path.display().to_string(),
            &hash,
            header.run_number,
            size,
        )?;
        if let Some(file) = &file {
            tracing::debug!(
                path = %path.display(),
                file_id = file.id,
                run = file.run_number,
                "discovered monitoring file"
            );
        }
        Ok(file)
    }
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dqmflow_protocol::FileState;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).expect("create");
        f.write_all(contents.as_bytes()).expect("write");
        path
    }

    fn good_file(run: u32) -> String {
        format!(
            "{{\"format\":\"nanodqmio\",\"version\":1,\"run\":{run}}}\n\
             {{\"component\":\"Pixel\",\"lumi\":1,\"bins\":[1.0],\"edges\":[0.0,1.0],\"entries\":3}}\n"
        )
    }

    fn setup(source: &tempfile::TempDir) -> (tempfile::TempDir, FileDiscovery, IndexStore) {
        let db_dir = tempfile::tempdir().expect("tempdir");
        let store = IndexStore::open(&db_dir.path().join("index.db"), 4).expect("open");
        let config = Config::with_paths(
            source.path().to_path_buf(),
            db_dir.path().join("index.db"),
        );
        let discovery = FileDiscovery::new(store.clone(), &config);
        (db_dir, discovery, store)
    }

    #[test]
    fn scan_records_new_files_as_discovered() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "b.ndjson", &good_file(101));
        write_file(source.path(), "a.ndjson", &good_file(100));

        let files = discovery.scan().expect("scan");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.state == FileState::Discovered));
        // Sorted walk: a before b regardless of creation order.
        assert!(files[0].path.ends_with("a.ndjson"));
        assert_eq!(files[0].run_number, 100);
        assert_eq!(files[1].run_number, 101);
        assert!(files[0].size_bytes > 0);
    }

    #[test]
    fn rescan_discovers_nothing_new() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "a.ndjson", &good_file(100));

        assert_eq!(discovery.scan().expect("first").len(), 1);
        assert_eq!(discovery.scan().expect("second").len(), 0);
    }

    #[test]
    fn identical_content_under_a_new_name_is_deduped() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "a.ndjson", &good_file(100));
        discovery.scan().expect("first");

        write_file(source.path(), "a-redelivered.ndjson", &good_file(100));
        assert_eq!(discovery.scan().expect("second").len(), 0);
    }

    #[test]
    fn wrong_extension_is_ignored() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "a.root", &good_file(100));
        write_file(source.path(), "notes.txt", "hello");

        assert_eq!(discovery.scan().expect("scan").len(), 0);
    }

    #[test]
    fn unreadable_header_skips_the_candidate() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "bad.ndjson", "not a header\n");
        write_file(source.path(), "good.ndjson", &good_file(100));

        let files = discovery.scan().expect("scan");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].run_number, 100);
    }

    #[test]
    fn files_in_subdirectories_are_found() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        let sub = source.path().join("run000100");
        std::fs::create_dir(&sub).expect("mkdir");
        write_file(&sub, "a.ndjson", &good_file(100));

        assert_eq!(discovery.scan().expect("scan").len(), 1);
    }

    #[test]
    fn missing_root_is_source_unavailable() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        let missing = source.path().join("nope");
        let config = Config::with_paths(missing, PathBuf::from("/unused"));
        let discovery = FileDiscovery::new(discovery.store.clone(), &config);

        let err = discovery.scan().expect_err("must fail");
        assert!(matches!(err, DqmError::SourceUnavailable { .. }), "{err}");
    }

    #[tokio::test]
    async fn scan_async_matches_sync_scan() {
        let source = tempfile::tempdir().expect("tempdir");
        let (_db, discovery, _store) = setup(&source);
        write_file(source.path(), "a.ndjson", &good_file(100));

        let files = discovery.scan_async().await.expect("scan");
        assert_eq!(files.len(), 1);
    }
}
