//! The analytics outputs: a timestamped log and a tabular report.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Serialize)]
pub(crate) struct ReportRow {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) sync_key: i64,
    pub(crate) cameras: usize,
    pub(crate) complete: bool,
    pub(crate) total_tracks: usize,
    pub(crate) caption: String,
}

/// Appends to `unified.log` and `unified.csv` under the output directory.
/// Both files survive worker restarts; the CSV header is written once.
pub(crate) struct Report {
    log_path: PathBuf,
    csv_path: PathBuf,
}

impl Report {
    pub(crate) fn new(output_dir: &Path) -> Self {
        Self {
            log_path: output_dir.join("unified.log"),
            csv_path: output_dir.join("unified.csv"),
        }
    }

    pub(crate) fn append(&self, row: ReportRow) -> std::io::Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(
            log,
            "{} sync_key={} cameras={} complete={} tracks={} {}",
            row.timestamp.to_rfc3339(),
            row.sync_key,
            row.cameras,
            row.complete,
            row.total_tracks,
            row.caption
        )?;

        let write_header = !self.csv_path.exists();
        let csv_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(csv_file);
        writer.serialize(row).map_err(std::io::Error::other)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sync_key: i64) -> ReportRow {
        ReportRow {
            timestamp: Utc::now(),
            sync_key,
            cameras: 2,
            complete: true,
            total_tracks: 5,
            caption: "two cars heading north".to_owned(),
        }
    }

    #[test]
    fn log_and_csv_accumulate_rows() {
        let dir = tempfile::tempdir().expect("temp dir");
        let report = Report::new(dir.path());

        report.append(row(1)).expect("append");
        report.append(row(2)).expect("append");

        let log = std::fs::read_to_string(dir.path().join("unified.log")).expect("log");
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("sync_key=1"));

        let csv = std::fs::read_to_string(dir.path().join("unified.csv")).expect("csv");
        // One header plus two rows.
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().next().is_some_and(|h| h.contains("sync_key")));
    }
}
