use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::crawler::task::{Classification, PageRecord};

/// On-disk layout of one corpus file: a flat `pages` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusFile {
    pub pages: Vec<PageRecord>,
}

/// Aggregate numbers over the whole corpus directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_pages: usize,
    pub file_count: usize,
}

/// A corpus file whose content has gone stale, with the seed URL to use
/// for its re-crawl.
#[derive(Debug, Clone)]
pub struct StaleEntry {
    pub file: String,
    pub url: String,
}

/// File-backed store of classified page records.
///
/// One JSON file per `(country, city, category, domain, date)` tuple;
/// records are appended with URL dedup inside the file. Concurrent crawl
/// tasks save sibling pages into the same file, so the read-modify-write
/// cycle runs under a write lock shared by all clones of the store.
#[derive(Debug, Clone)]
pub struct CorpusStorage {
    data_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl CorpusStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).context(format!(
            "Failed to create corpus directory: {}",
            data_dir.display()
        ))?;
        Ok(Self {
            data_dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Persist a record into its classification-tuple file for today.
    /// Returns false if an entry with the same URL was already present.
    pub fn save_page(&self, classification: &Classification, record: &PageRecord) -> Result<bool> {
        let file_name = self.file_name(classification, &record.url, Utc::now())?;
        let path = self.data_dir.join(&file_name);

        let _guard = self.write_lock.lock().expect("corpus write lock poisoned");
        let mut data = self.load_file(&path);
        if data.pages.iter().any(|page| page.url == record.url) {
            debug!(url = %record.url, file = %file_name, "Duplicate URL, skipping append");
            return Ok(false);
        }

        data.pages.push(record.clone());
        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize corpus file")?;
        fs::write(&path, contents)
            .context(format!("Failed to write corpus file: {}", path.display()))?;

        debug!(url = %record.url, file = %file_name, "Saved page");
        Ok(true)
    }

    /// Derive the file name `{country}-{city}-{category}-{domain}-{YYYYMMDD}.json`.
    /// Classification components are reduced to alphanumerics and hyphens;
    /// the domain keeps its dots but drops a leading `www.`.
    fn file_name(
        &self,
        classification: &Classification,
        url: &str,
        date: DateTime<Utc>,
    ) -> Result<String> {
        let parsed = Url::parse(url).context(format!("Unparseable record URL: {url}"))?;
        let host = parsed
            .host_str()
            .context(format!("Record URL has no host: {url}"))?;
        let domain = host.strip_prefix("www.").unwrap_or(host);

        Ok(format!(
            "{}-{}-{}-{}-{}.json",
            sanitize(&classification.country),
            sanitize(&classification.city),
            sanitize(&classification.category),
            domain,
            date.format("%Y%m%d"),
        ))
    }

    /// Read a corpus file; a missing, unreadable or corrupt file counts as
    /// empty (lossy but never fatal).
    fn load_file(&self, path: &Path) -> CorpusFile {
        if !path.exists() {
            return CorpusFile::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => data,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "Corrupt corpus file, treating as empty");
                    CorpusFile::default()
                }
            },
            Err(err) => {
                warn!(file = %path.display(), error = %err, "Unreadable corpus file, treating as empty");
                CorpusFile::default()
            }
        }
    }

    /// Sorted list of corpus file names (the index of available corpora).
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.data_dir).context(format!(
            "Failed to read corpus directory: {}",
            self.data_dir.display()
        ))? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Full scan of all corpus files for aggregate stats.
    pub fn stats(&self) -> Result<CorpusStats> {
        let files = self.list_files()?;
        let file_count = files.len();
        let mut total_pages = 0;
        for name in files {
            total_pages += self.load_file(&self.data_dir.join(name)).pages.len();
        }
        Ok(CorpusStats {
            total_pages,
            file_count,
        })
    }

    /// Find files containing records older than `max_age`. For each stale
    /// file the first stale record's URL is returned as the re-crawl seed.
    pub fn find_stale(&self, max_age: Duration) -> Result<Vec<StaleEntry>> {
        let threshold = Utc::now() - max_age;
        let mut stale = Vec::new();
        for name in self.list_files()? {
            let data = self.load_file(&self.data_dir.join(&name));
            if let Some(page) = data.pages.iter().find(|page| page.crawled_at < threshold) {
                stale.push(StaleEntry {
                    file: name,
                    url: page.url.clone(),
                });
            }
        }
        Ok(stale)
    }
}

/// Reduce a classification component to alphanumerics and hyphens.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}
