// =============================================================================
// Trade Journal — append-only per-day JSON logs
// =============================================================================
//
// One file per calendar date per market: `{MARKET}trades_{YYYYMMDD}.json`,
// an array of entry objects. Each write loads the existing array, appends,
// and rewrites atomically; entries per day stay small. Writes for a single
// date are serialized by a per-date lock.
//
// Retention: on every write, files beyond the 30 most recent (by the date
// embedded in the filename) are pruned.
//
// A corrupt file is renamed `*.corrupt` and a fresh array is started; the
// corruption is reported but never fatal.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::{ContractFamily, Direction, Market, OcType, Side};

/// Number of daily files kept on disk.
const RETENTION_FILES: usize = 30;

// =============================================================================
// Entry model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    OrderSubmitted,
    Deal,
    Cancel,
    Fail,
}

/// Metadata resolved at write time, so a reader never needs the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedMeta {
    pub market: Market,
    /// Contract code (TX) or symbol (BTC).
    pub code: String,
    #[serde(default)]
    pub family: Option<ContractFamily>,
    #[serde(default)]
    pub direction: Option<Direction>,
    pub oc: OcType,
    pub side: Side,
    pub quantity: f64,
    /// Fill price on deals; submit hint otherwise.
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub is_manual: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub kind: EntryKind,
    pub order_id: String,
    /// Local wall-clock, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// "auto" for webhook-originated orders, "manual" otherwise.
    pub category: String,
    #[serde(default)]
    pub raw: serde_json::Value,
    pub resolved: ResolvedMeta,
    /// Failure or cancel reason, operator-facing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JournalEntry {
    pub fn category_for(is_manual: bool) -> String {
        if is_manual { "manual" } else { "auto" }.to_string()
    }
}

// =============================================================================
// TradeJournal
// =============================================================================

/// Append-only journal for one market.
pub struct TradeJournal {
    market: Market,
    dir: PathBuf,
    /// Per-date write locks.
    locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
}

impl TradeJournal {
    pub fn new(market: Market, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), error = %e, "failed to create journal directory");
        }
        Self {
            market,
            dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    fn file_name(&self, date: NaiveDate) -> String {
        format!("{}trades_{}.json", self.market.tag(), date.format("%Y%m%d"))
    }

    fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(self.file_name(date))
    }

    fn date_lock(&self, date: NaiveDate) -> Arc<Mutex<()>> {
        self.locks.lock().entry(date).or_default().clone()
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Append `entry` to the file for `date`, then prune retention.
    pub fn append_on(&self, date: NaiveDate, entry: JournalEntry) {
        let lock = self.date_lock(date);
        let _guard = lock.lock();

        let path = self.file_path(date);
        let mut entries = self.read_file(&path);
        entries.push(entry);

        match serde_json::to_string_pretty(&entries) {
            Ok(content) => {
                let tmp = path.with_extension("json.tmp");
                let write = std::fs::write(&tmp, content)
                    .and_then(|_| std::fs::rename(&tmp, &path));
                if let Err(e) = write {
                    error!(path = %path.display(), error = %e, "journal write failed");
                }
            }
            Err(e) => error!(error = %e, "journal entry serialization failed"),
        }

        drop(_guard);
        self.prune_retention();
    }

    /// Append to today's file.
    pub fn append(&self, entry: JournalEntry) {
        self.append_on(chrono::Local::now().date_naive(), entry);
    }

    /// Delete files beyond the newest [`RETENTION_FILES`].
    fn prune_retention(&self) {
        let mut dated = self.list_files();
        if dated.len() <= RETENTION_FILES {
            return;
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        for (date, path) in dated.into_iter().skip(RETENTION_FILES) {
            match std::fs::remove_file(&path) {
                Ok(_) => info!(date = %date, file = %path.display(), "pruned old journal file"),
                Err(e) => warn!(file = %path.display(), error = %e, "failed to prune journal file"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------------

    /// Journal files on disk, with their embedded dates.
    fn list_files(&self) -> Vec<(NaiveDate, PathBuf)> {
        let prefix = format!("{}trades_", self.market.tag());
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let stem = name.strip_prefix(&prefix)?.strip_suffix(".json")?;
                let date = NaiveDate::parse_from_str(stem, "%Y%m%d").ok()?;
                Some((date, e.path()))
            })
            .collect()
    }

    /// Parse a file, quarantining it on corruption.
    fn read_file(&self, path: &Path) -> Vec<JournalEntry> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Vec::new(), // no file yet
        };

        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                let quarantine = path.with_extension("json.corrupt");
                error!(
                    file = %path.display(),
                    error = %e,
                    quarantine = %quarantine.display(),
                    "journal file corrupt — quarantined"
                );
                if let Err(e) = std::fs::rename(path, &quarantine) {
                    error!(error = %e, "failed to quarantine corrupt journal");
                }
                Vec::new()
            }
        }
    }

    /// All entries for one date.
    pub fn entries_for_date(&self, date: NaiveDate) -> Vec<JournalEntry> {
        let lock = self.date_lock(date);
        let _guard = lock.lock();
        self.read_file(&self.file_path(date))
    }

    /// All entries across the month of `date`, in date order.
    pub fn entries_for_month(&self, date: NaiveDate) -> Vec<JournalEntry> {
        let mut files = self.list_files();
        files.retain(|(d, _)| d.year() == date.year() && d.month() == date.month());
        files.sort_by_key(|(d, _)| *d);

        files
            .into_iter()
            .flat_map(|(d, _)| self.entries_for_date(d))
            .collect()
    }

    /// All entries across the most recent `n_files` days, oldest first.
    pub fn entries_recent(&self, n_files: usize) -> Vec<JournalEntry> {
        let mut files = self.list_files();
        files.sort_by(|a, b| b.0.cmp(&a.0));
        files.truncate(n_files);
        files.reverse();

        files
            .into_iter()
            .flat_map(|(d, _)| self.entries_for_date(d))
            .collect()
    }

    /// Open-position deals (`Deal` with `oc = New`) across the most recent
    /// `n_files` days, oldest first. Used to resolve cross-day FIFO pairing.
    pub fn open_entries_recent(&self, n_files: usize) -> Vec<JournalEntry> {
        self.entries_recent(n_files)
            .into_iter()
            .filter(|e| e.kind == EntryKind::Deal && e.resolved.oc == OcType::New)
            .collect()
    }

    /// Number of journal files currently on disk.
    pub fn file_count(&self) -> usize {
        self.list_files().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal(tag: &str) -> (TradeJournal, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "tvbridge-journal-{}-{}",
            std::process::id(),
            tag
        ));
        std::fs::remove_dir_all(&dir).ok();
        (TradeJournal::new(Market::Tx, &dir), dir)
    }

    fn entry(kind: EntryKind, order_id: &str, oc: OcType, price: f64, quantity: f64) -> JournalEntry {
        JournalEntry {
            kind,
            order_id: order_id.to_string(),
            timestamp: "2025-07-01 09:00:00".to_string(),
            category: "auto".to_string(),
            raw: serde_json::Value::Null,
            resolved: ResolvedMeta {
                market: Market::Tx,
                code: "TXFG5".to_string(),
                family: Some(ContractFamily::Txf),
                direction: Some(Direction::OpenLong),
                oc,
                side: Side::Buy,
                quantity,
                price,
                is_manual: false,
            },
            reason: None,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let (journal, dir) = temp_journal("rw");
        let date = d(2025, 7, 1);
        journal.append_on(date, entry(EntryKind::OrderSubmitted, "O1", OcType::New, 0.0, 1.0));
        journal.append_on(date, entry(EntryKind::Deal, "O1", OcType::New, 22000.0, 1.0));

        let entries = journal.entries_for_date(date);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::OrderSubmitted);
        assert_eq!(entries[1].kind, EntryKind::Deal);
        assert_eq!(entries[1].resolved.price, 22000.0);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn retention_keeps_newest_thirty() {
        let (journal, dir) = temp_journal("retention");
        let start = d(2025, 1, 1);
        for i in 0..35 {
            let date = start + chrono::Duration::days(i);
            journal.append_on(date, entry(EntryKind::Deal, &format!("O{i}"), OcType::New, 100.0, 1.0));
        }
        assert_eq!(journal.file_count(), 30);
        // The oldest five are gone, the newest survive.
        assert!(journal.entries_for_date(start).is_empty());
        assert_eq!(
            journal
                .entries_for_date(start + chrono::Duration::days(34))
                .len(),
            1
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn corrupt_file_is_quarantined_not_fatal() {
        let (journal, dir) = temp_journal("corrupt");
        let date = d(2025, 7, 2);
        std::fs::create_dir_all(&dir).ok();
        std::fs::write(dir.join("TXtrades_20250702.json"), "{not json").unwrap();

        // Read survives and quarantines.
        assert!(journal.entries_for_date(date).is_empty());
        assert!(dir.join("TXtrades_20250702.json.corrupt").exists());

        // A fresh write starts a new array.
        journal.append_on(date, entry(EntryKind::Deal, "O1", OcType::New, 1.0, 1.0));
        assert_eq!(journal.entries_for_date(date).len(), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn open_entries_scan_filters_new_deals() {
        let (journal, dir) = temp_journal("open-scan");
        let day1 = d(2025, 7, 1);
        let day2 = d(2025, 7, 2);
        journal.append_on(day1, entry(EntryKind::Deal, "O1", OcType::New, 100.0, 2.0));
        journal.append_on(day1, entry(EntryKind::Deal, "O2", OcType::Cover, 120.0, 1.0));
        journal.append_on(day2, entry(EntryKind::Deal, "O3", OcType::New, 110.0, 1.0));
        journal.append_on(day2, entry(EntryKind::Fail, "O4", OcType::New, 0.0, 1.0));

        let opens = journal.open_entries_recent(7);
        assert_eq!(opens.len(), 2);
        // Oldest first.
        assert_eq!(opens[0].order_id, "O1");
        assert_eq!(opens[1].order_id, "O3");
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn month_reader_spans_files() {
        let (journal, dir) = temp_journal("month");
        journal.append_on(d(2025, 6, 30), entry(EntryKind::Deal, "O0", OcType::New, 1.0, 1.0));
        journal.append_on(d(2025, 7, 1), entry(EntryKind::Deal, "O1", OcType::New, 1.0, 1.0));
        journal.append_on(d(2025, 7, 15), entry(EntryKind::Deal, "O2", OcType::New, 1.0, 1.0));

        let entries = journal.entries_for_month(d(2025, 7, 20));
        assert_eq!(entries.len(), 2);
        std::fs::remove_dir_all(dir).ok();
    }
}
