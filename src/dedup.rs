//! Probabilistic commit deduplication
//!
//! Two bloom filters guard the pipeline: one keyed by commit SHA, so a
//! commit surfaced by overlapping search pages or adjacent date shards is
//! fetched once, and one keyed by a content signature, so the same fix
//! mirrored across forks collapses to a single record. Insertion is
//! irreversible and `contains` may report false positives (at the
//! configured rate) but never false negatives. Skipped items can be written
//! to an append-only log so an operator can audit the false-positive risk.

use bloomfilter::Bloom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::DedupConfig;
use crate::error::Result;
use crate::types::{Commit, CommitFile};

/// Probabilistic set membership over opaque byte keys
pub struct DedupFilter {
    bloom: Bloom<[u8]>,
}

impl DedupFilter {
    /// Create a filter sized for the configured capacity and error rate
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(config.expected_items, config.false_positive_rate),
        }
    }

    /// Insert a key. Irreversible; inserting twice is a no-op.
    pub fn insert(&mut self, key: &[u8]) {
        self.bloom.set(key);
    }

    /// Membership test. May return a false positive, never a false negative.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Test-and-insert in one call; returns whether the key was already present
    pub fn check_and_insert(&mut self, key: &[u8]) -> bool {
        let seen = self.bloom.check(key);
        if !seen {
            self.bloom.set(key);
        }
        seen
    }
}

impl std::fmt::Debug for DedupFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupFilter")
            .field("bits", &self.bloom.number_of_bits())
            .field("hashes", &self.bloom.number_of_hash_functions())
            .finish()
    }
}

/// Content signature collapsing near-duplicate commits
///
/// Concatenation of the changed files' blob SHAs; two commits touching
/// byte-identical content (mirrored forks, cherry-picks of whole files)
/// produce the same signature. Commits with no usable blob SHAs fall back
/// to author date plus the first line of the message.
pub fn commit_signature(commit: &Commit) -> String {
    let shas: Vec<&str> = commit
        .files
        .iter()
        .filter_map(|f: &CommitFile| f.sha.as_deref())
        .collect();

    if shas.is_empty() {
        let first_line = commit.commit.message.lines().next().unwrap_or_default();
        format!("{}\n{}", commit.commit.author.date, first_line)
    } else {
        shas.join(",")
    }
}

/// Append-only log of dedup-filter hits
///
/// One `{sha}\t{repo_full_name}` line per skipped item.
#[derive(Debug)]
pub struct DedupLog {
    writer: BufWriter<File>,
}

impl DedupLog {
    /// Open (or create) the log file for appending
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Record one skipped item, flushed immediately so the log survives an
    /// abrupt shutdown
    pub async fn record(&mut self, sha: &str, repo_full_name: &str) -> Result<()> {
        let line = format!("{sha}\t{repo_full_name}\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitAuthor, CommitMeta};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn small_config() -> DedupConfig {
        DedupConfig {
            expected_items: 100_000,
            false_positive_rate: 1e-4,
        }
    }

    #[test]
    fn insert_then_contains() {
        let mut filter = DedupFilter::new(&small_config());
        assert!(!filter.contains(b"a1b2c3"));
        filter.insert(b"a1b2c3");
        assert!(filter.contains(b"a1b2c3"));
    }

    #[test]
    fn check_and_insert_reports_prior_membership() {
        let mut filter = DedupFilter::new(&small_config());
        assert!(!filter.check_and_insert(b"deadbeef"));
        assert!(filter.check_and_insert(b"deadbeef"));
    }

    #[test]
    fn double_insert_does_not_affect_other_keys() {
        let mut filter = DedupFilter::new(&small_config());
        filter.insert(b"key-one");
        filter.insert(b"key-one");
        filter.insert(b"key-one");
        assert!(!filter.contains(b"key-two"));
        assert!(!filter.contains(b"key-three"));
    }

    #[test]
    fn false_positive_rate_stays_near_configured_bound() {
        let config = DedupConfig {
            expected_items: 10_000,
            false_positive_rate: 1e-3,
        };
        let mut filter = DedupFilter::new(&config);
        let mut rng = StdRng::seed_from_u64(0x5eed);

        // Fill to capacity with random 20-byte keys
        for _ in 0..10_000 {
            let key: [u8; 20] = rng.r#gen();
            filter.insert(&key);
        }

        // Probe with keys that were never inserted
        let mut false_positives = 0usize;
        let probes = 20_000usize;
        for _ in 0..probes {
            let key: [u8; 20] = rng.r#gen();
            if filter.contains(&key) {
                false_positives += 1;
            }
        }

        // 10x headroom over the configured 1e-3 rate keeps this stable
        let observed = false_positives as f64 / probes as f64;
        assert!(
            observed < 1e-2,
            "observed false-positive rate {observed} far exceeds configured 1e-3"
        );
    }

    fn commit_with_files(shas: &[Option<&str>]) -> Commit {
        Commit {
            sha: "c0ffee".to_string(),
            url: String::new(),
            commit: CommitMeta {
                url: String::new(),
                author: CommitAuthor {
                    date: "2019-01-02T03:04:05Z".to_string(),
                },
                message: "fix overflow\n\ndetails".to_string(),
            },
            stats: None,
            parents: vec![],
            files: shas
                .iter()
                .map(|sha| CommitFile {
                    sha: sha.map(str::to_string),
                    filename: "f".to_string(),
                    status: None,
                    additions: 0,
                    deletions: 0,
                    changes: 0,
                    raw_url: None,
                    blob_url: None,
                })
                .collect(),
        }
    }

    #[test]
    fn signature_joins_blob_shas() {
        let commit = commit_with_files(&[Some("aaa"), Some("bbb"), Some("ccc")]);
        assert_eq!(commit_signature(&commit), "aaa,bbb,ccc");
    }

    #[test]
    fn signature_falls_back_to_date_and_message() {
        let commit = commit_with_files(&[]);
        assert_eq!(
            commit_signature(&commit),
            "2019-01-02T03:04:05Z\nfix overflow"
        );
    }

    #[tokio::test]
    async fn dedup_log_appends_tab_separated_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dedup-skips.txt");

        let mut log = DedupLog::open(&path).await.expect("open log");
        log.record("a1", "owner/repo").await.expect("record");
        log.record("b2", "other/repo").await.expect("record");
        drop(log);

        // Each record flushes, so the lines are durable without a close
        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "a1\towner/repo\nb2\tother/repo\n");
    }
}
