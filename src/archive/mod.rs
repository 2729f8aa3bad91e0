//! Cold-storage archival engine for raw article HTML.
//!
//! Raw HTML is moved out of the database into monthly, source-partitioned,
//! gzipped batch files. The archive is additive: new data goes into new
//! batch files, existing files are never rewritten.

mod scheduler;

pub use scheduler::ArchiveScheduler;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::ArchiveCompression;
use crate::repository::{NewArchiveRecord, RepositoryError, Store};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Corrupt archive: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// One archived article inside a batch file.
#[derive(Debug, Serialize, Deserialize)]
struct BatchEntry {
    article_id: i64,
    url_hash: String,
    raw_html: String,
}

/// Batch file payload: `{"articles": [...]}`.
#[derive(Debug, Serialize, Deserialize)]
struct BatchPayload {
    articles: Vec<BatchEntry>,
}

/// Manifest entry for one batch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestBatch {
    pub filename: String,
    pub article_ids: Vec<i64>,
    pub count: usize,
    /// ISO-8601 with Z suffix.
    pub created_at: String,
}

/// Per-month manifest enumerating every batch file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub source: String,
    pub month: String,
    pub batches: Vec<ManifestBatch>,
}

/// Result of archiving one source.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub source: String,
    pub archived_count: usize,
    pub freed_bytes: u64,
    pub archive_dir: PathBuf,
}

/// Result of a restore call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreOutcome {
    pub restored_count: usize,
    pub failed_count: usize,
}

/// Archive summary for one source.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub source: String,
    pub total_batches: usize,
    pub total_archived_articles: i64,
    pub total_size_bytes: u64,
    pub months: Vec<String>,
}

/// Archival engine over the operational store and the archive filesystem.
pub struct ArchiveService {
    store: Store,
    base_path: PathBuf,
    batch_size: usize,
    compression: ArchiveCompression,
}

impl ArchiveService {
    pub fn new(
        store: Store,
        base_path: &Path,
        batch_size: usize,
        compression: ArchiveCompression,
    ) -> Self {
        Self {
            store,
            base_path: base_path.to_path_buf(),
            batch_size: batch_size.max(1),
            compression,
        }
    }

    fn month_dir(&self, source: &str) -> PathBuf {
        let month = Utc::now().format("%Y-%m").to_string();
        self.base_path.join("raw_html").join(source).join(month)
    }

    /// Archive a source's raw HTML in additive mode. Only articles not yet
    /// archived are selected; each batch is finalized (file + records +
    /// manifest entry) before the next starts.
    pub fn archive_source(
        &self,
        source: &str,
        before_date: Option<NaiveDate>,
        target_date: Option<NaiveDate>,
    ) -> Result<ArchiveOutcome> {
        let repo = self.store.archives();
        let articles = repo.articles_for_archive(source, before_date, target_date)?;

        let archive_dir = self.month_dir(source);
        if articles.is_empty() {
            return Ok(ArchiveOutcome {
                source: source.to_string(),
                archived_count: 0,
                freed_bytes: 0,
                archive_dir,
            });
        }

        fs::create_dir_all(&archive_dir)?;
        let next_batch = next_batch_number(&archive_dir)?;

        let mut archived_count = 0usize;
        let mut freed_bytes = 0u64;
        let now = Utc::now();

        for (index, chunk) in articles.chunks(self.batch_size).enumerate() {
            let batch_num = next_batch + index;
            let filename = batch_filename(batch_num, self.compression);
            let batch_path = archive_dir.join(&filename);
            if batch_path.exists() {
                return Err(ArchiveError::Corrupt(format!(
                    "batch file already exists: {}",
                    batch_path.display()
                )));
            }

            let payload = BatchPayload {
                articles: chunk
                    .iter()
                    .map(|a| BatchEntry {
                        article_id: a.id,
                        url_hash: a.url_hash.clone(),
                        raw_html: a.raw_html.clone().unwrap_or_default(),
                    })
                    .collect(),
            };
            write_batch_file(&batch_path, &payload, self.compression)?;
            let compressed_size = fs::metadata(&batch_path)?.len() as i64;

            let records: Vec<NewArchiveRecord> = chunk
                .iter()
                .map(|a| {
                    let original_size =
                        a.raw_html.as_deref().map(|h| h.len()).unwrap_or(0) as i64;
                    NewArchiveRecord {
                        article_id: a.id,
                        source: source.to_string(),
                        archive_path: batch_path.to_string_lossy().to_string(),
                        original_size,
                        // Approximate per-article share of the file
                        compressed_size: Some(compressed_size / chunk.len() as i64),
                        archived_at: now,
                    }
                })
                .collect();

            repo.commit_batch(&records)?;
            append_manifest(&archive_dir, source, &filename, chunk.iter().map(|a| a.id))?;

            archived_count += chunk.len();
            freed_bytes += records.iter().map(|r| r.original_size as u64).sum::<u64>();
        }

        info!(
            source,
            archived = archived_count,
            freed_mb = freed_bytes / (1024 * 1024),
            "Archive pass complete"
        );
        Ok(ArchiveOutcome {
            source: source.to_string(),
            archived_count,
            freed_bytes,
            archive_dir,
        })
    }

    /// Archive every source, isolating per-source failures.
    pub fn archive_all_sources(&self, before_date: Option<NaiveDate>) -> Vec<ArchiveOutcome> {
        let sources = match self.store.articles().sources() {
            Ok(sources) => sources,
            Err(e) => {
                error!(error = %e, "Could not enumerate sources for archiving");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for source in sources {
            match self.archive_source(&source, before_date, None) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(source = %source, error = %e, "Failed to archive source"),
            }
        }
        outcomes
    }

    /// Restore raw HTML for the given articles from their batch files.
    /// Article ids without an ARCHIVED record or missing from their batch
    /// file count as failures.
    pub fn restore(&self, article_ids: &[i64]) -> Result<RestoreOutcome> {
        let repo = self.store.archives();
        let records = repo.archived_records_for(article_ids)?;

        let mut outcome = RestoreOutcome::default();
        let with_records: std::collections::HashSet<i64> =
            records.iter().map(|r| r.article_id).collect();
        outcome.failed_count += article_ids
            .iter()
            .filter(|id| !with_records.contains(id))
            .count();

        // Group by batch file so each is opened once
        let mut by_path: HashMap<String, Vec<i64>> = HashMap::new();
        for record in &records {
            by_path
                .entry(record.archive_path.clone())
                .or_default()
                .push(record.article_id);
        }

        let mut restored: Vec<(i64, String)> = Vec::new();
        for (path, ids) in by_path {
            let payload = match read_batch_file(Path::new(&path)) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(path = %path, error = %e, "Failed to read archive batch");
                    outcome.failed_count += ids.len();
                    continue;
                }
            };
            let lookup: HashMap<i64, String> = payload
                .articles
                .into_iter()
                .map(|entry| (entry.article_id, entry.raw_html))
                .collect();
            for id in ids {
                match lookup.get(&id) {
                    Some(html) => restored.push((id, html.clone())),
                    None => {
                        warn!(article_id = id, path = %path, "Article missing from batch file");
                        outcome.failed_count += 1;
                    }
                }
            }
        }

        outcome.restored_count = repo.restore_articles(&restored)?;
        outcome.failed_count += restored.len() - outcome.restored_count;
        Ok(outcome)
    }

    /// Read one article's raw HTML from its batch file without restoring
    /// it into the database. Used by the reparse engine.
    pub fn raw_html_from_archive(&self, article_id: i64) -> Result<Option<String>> {
        let Some(record) = self.store.archives().archived_record_for(article_id)? else {
            return Ok(None);
        };
        let payload = read_batch_file(Path::new(&record.archive_path))?;
        Ok(payload
            .articles
            .into_iter()
            .find(|entry| entry.article_id == article_id)
            .map(|entry| entry.raw_html))
    }

    /// Archive summary for a source: batch files, months, and sizes on
    /// disk plus the database's archived-article count.
    pub fn archive_info(&self, source: &str) -> Result<ArchiveInfo> {
        let source_dir = self.base_path.join("raw_html").join(source);
        let mut total_batches = 0usize;
        let mut total_size_bytes = 0u64;
        let mut months = Vec::new();

        if source_dir.exists() {
            for entry in fs::read_dir(&source_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                months.push(entry.file_name().to_string_lossy().to_string());
                for file in fs::read_dir(entry.path())? {
                    let file = file?;
                    let name = file.file_name().to_string_lossy().to_string();
                    if name.starts_with("batch_") && name.contains(".json") {
                        total_batches += 1;
                        total_size_bytes += file.metadata()?.len();
                    }
                }
            }
        }
        months.sort();

        Ok(ArchiveInfo {
            source: source.to_string(),
            total_batches,
            total_archived_articles: self.store.archives().count_archived(source)?,
            total_size_bytes,
            months,
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

fn batch_filename(batch_num: usize, compression: ArchiveCompression) -> String {
    match compression {
        ArchiveCompression::Gzip => format!("batch_{batch_num:03}.json.gz"),
        ArchiveCompression::None => format!("batch_{batch_num:03}.json"),
    }
}

/// Next sequential batch number in a month directory, derived by scanning
/// existing filenames so finished files are never overwritten.
fn next_batch_number(archive_dir: &Path) -> Result<usize> {
    let mut max_num = 0usize;
    if archive_dir.exists() {
        for entry in fs::read_dir(archive_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix("batch_") else {
                continue;
            };
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(num) = digits.parse::<usize>() {
                max_num = max_num.max(num);
            }
        }
    }
    Ok(max_num + 1)
}

fn write_batch_file(
    path: &Path,
    payload: &BatchPayload,
    compression: ArchiveCompression,
) -> Result<()> {
    let json = serde_json::to_vec(payload)?;
    match compression {
        ArchiveCompression::Gzip => {
            let file = fs::File::create(path)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?;
        }
        ArchiveCompression::None => {
            fs::write(path, &json)?;
        }
    }
    Ok(())
}

fn read_batch_file(path: &Path) -> Result<BatchPayload> {
    let bytes = fs::read(path)?;
    let json = if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ArchiveError::Corrupt(format!("{}: {e}", path.display())))?;
        out
    } else {
        bytes
    };
    Ok(serde_json::from_slice(&json)?)
}

/// Append a batch entry to the month's manifest, creating it on first use.
fn append_manifest(
    archive_dir: &Path,
    source: &str,
    filename: &str,
    article_ids: impl Iterator<Item = i64>,
) -> Result<()> {
    let manifest_path = archive_dir.join("manifest.json");
    let mut manifest: Manifest = if manifest_path.exists() {
        serde_json::from_str(&fs::read_to_string(&manifest_path)?)?
    } else {
        Manifest {
            source: source.to_string(),
            month: archive_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            batches: Vec::new(),
        }
    };

    let article_ids: Vec<i64> = article_ids.collect();
    manifest.batches.push(ManifestBatch {
        filename: filename.to_string(),
        count: article_ids.len(),
        article_ids,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });

    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{compute_url_hash, Article};
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store, ArchiveService) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let service = ArchiveService::new(
            store.clone(),
            &dir.path().join("archives"),
            500,
            ArchiveCompression::Gzip,
        );
        (dir, store, service)
    }

    fn insert_articles(store: &Store, source: &str, count: usize, crawled_daysago: i64) -> Vec<i64> {
        let repo = store.articles();
        (0..count)
            .map(|i| {
                let url = format!("https://{source}.example.com/news/{i}");
                repo.insert(&Article {
                    id: 0,
                    url_hash: compute_url_hash(&url),
                    url,
                    title: format!("標題 {i}"),
                    content: "內容".to_string(),
                    summary: None,
                    author: None,
                    source: source.to_string(),
                    crawler_name: format!("{source}_article"),
                    category: None,
                    sub_category: None,
                    tags: None,
                    published_at: None,
                    crawled_at: Utc::now() - Duration::days(crawled_daysago),
                    raw_html: Some(format!("<html><body>article {i}</body></html>")),
                    images: None,
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn archive_is_additive_and_idempotent() {
        let (_dir, store, service) = setup();
        let small = ArchiveService::new(
            store.clone(),
            service.base_path.as_path(),
            5,
            ArchiveCompression::Gzip,
        );
        insert_articles(&store, "Y", 12, 0);
        let today = Utc::now().date_naive();

        let first = small.archive_source("Y", None, Some(today)).unwrap();
        assert_eq!(first.archived_count, 12);

        // batch_001..003 with sizes 5/5/2
        let manifest_path = first.archive_dir.join("manifest.json");
        let manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.batches.len(), 3);
        assert_eq!(
            manifest
                .batches
                .iter()
                .map(|b| b.count)
                .collect::<Vec<_>>(),
            vec![5, 5, 2]
        );
        assert_eq!(manifest.batches[0].filename, "batch_001.json.gz");
        assert!(manifest.batches[2].created_at.ends_with('Z'));

        // Re-run: nothing new, no files touched, manifest unchanged
        let manifest_before = fs::read_to_string(&manifest_path).unwrap();
        let second = small.archive_source("Y", None, Some(today)).unwrap();
        assert_eq!(second.archived_count, 0);
        assert_eq!(fs::read_to_string(&manifest_path).unwrap(), manifest_before);

        // raw_html cleared; each article has exactly one ARCHIVED record
        for article in store.articles().fetch_for_window(None, None, 100, 0).unwrap() {
            assert!(article.raw_html.is_none());
            let record = store
                .archives()
                .archived_record_for(article.id)
                .unwrap()
                .unwrap();
            assert!(record.archive_path.ends_with(".json.gz"));
        }
    }

    #[test]
    fn restore_round_trips_bytes() {
        let (_dir, store, service) = setup();
        let ids = insert_articles(&store, "Z", 3, 0);
        let originals: Vec<String> = ids
            .iter()
            .map(|id| {
                store
                    .articles()
                    .get_by_id(*id)
                    .unwrap()
                    .unwrap()
                    .raw_html
                    .unwrap()
            })
            .collect();

        service.archive_source("Z", None, None).unwrap();
        let outcome = service.restore(&ids).unwrap();
        assert_eq!(outcome.restored_count, 3);
        assert_eq!(outcome.failed_count, 0);

        for (id, original) in ids.iter().zip(&originals) {
            let article = store.articles().get_by_id(*id).unwrap().unwrap();
            assert_eq!(article.raw_html.as_deref(), Some(original.as_str()));
            // Record flipped to ACTIVE: no ARCHIVED record remains
            assert!(store.archives().archived_record_for(*id).unwrap().is_none());
        }
    }

    #[test]
    fn restore_counts_missing_ids_as_failures() {
        let (_dir, store, service) = setup();
        let ids = insert_articles(&store, "Z", 2, 0);
        service.archive_source("Z", None, None).unwrap();

        let outcome = service.restore(&[ids[0], 99999]).unwrap();
        assert_eq!(outcome.restored_count, 1);
        assert_eq!(outcome.failed_count, 1);
    }

    #[test]
    fn read_without_restore_leaves_archive_state() {
        let (_dir, store, service) = setup();
        let ids = insert_articles(&store, "W", 2, 0);
        service.archive_source("W", None, None).unwrap();

        let html = service.raw_html_from_archive(ids[1]).unwrap().unwrap();
        assert!(html.contains("article 1"));

        // Still archived: reading does not restore
        let article = store.articles().get_by_id(ids[1]).unwrap().unwrap();
        assert!(article.raw_html.is_none());
        assert!(store
            .archives()
            .archived_record_for(ids[1])
            .unwrap()
            .is_some());

        assert!(service.raw_html_from_archive(99999).unwrap().is_none());
    }

    #[test]
    fn date_predicates_select_rows() {
        let (_dir, store, service) = setup();
        insert_articles(&store, "D", 2, 0); // today
        insert_articles_offset(&store, "D", 3, 2); // two days ago

        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let outcome = service.archive_source("D", Some(yesterday), None).unwrap();
        assert_eq!(outcome.archived_count, 3);

        let outcome = service
            .archive_source("D", None, Some(Utc::now().date_naive()))
            .unwrap();
        assert_eq!(outcome.archived_count, 2);
    }

    fn insert_articles_offset(store: &Store, source: &str, count: usize, days_ago: i64) {
        let repo = store.articles();
        for i in 0..count {
            let url = format!("https://{source}.example.com/old/{days_ago}/{i}");
            repo.insert(&Article {
                id: 0,
                url_hash: compute_url_hash(&url),
                url,
                title: "舊文".to_string(),
                content: "內容".to_string(),
                summary: None,
                author: None,
                source: source.to_string(),
                crawler_name: format!("{source}_article"),
                category: None,
                sub_category: None,
                tags: None,
                published_at: None,
                crawled_at: Utc::now() - Duration::days(days_ago),
                raw_html: Some("<html>old</html>".to_string()),
                images: None,
            })
            .unwrap();
        }
    }

    #[test]
    fn archive_info_reports_batches() {
        let (_dir, store, service) = setup();
        insert_articles(&store, "I", 4, 0);
        service.archive_source("I", None, None).unwrap();

        let info = service.archive_info("I").unwrap();
        assert_eq!(info.total_batches, 1);
        assert_eq!(info.total_archived_articles, 4);
        assert_eq!(info.months.len(), 1);
        assert!(info.total_size_bytes > 0);
    }
}
