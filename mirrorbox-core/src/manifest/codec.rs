//! Line-oriented manifest persistence.
//!
//! The format is deliberately plain text so a stuck deployment can be
//! inspected with a pager:
//!
//! ```text
//! <continuation cursor>
//! <folder count>
//! <folder id>
//! <folder path>
//! ...
//! <file count>
//! <file id>
//! <file path>
//! <file size>
//! <file modified-time as 100-ns ticks since epoch>
//! <file checksum>
//! ...
//! ```
//!
//! A load failure of any kind is a [`SyncError::Parse`]; the caller rebuilds
//! the manifest from a full scan instead of guessing.

use std::io::{BufRead, Write};

use chrono::{DateTime, Utc};

use crate::change::RepoTag;
use crate::error::{Result, SyncError};
use crate::manifest::{FileRecord, Manifest};
use crate::path::SyncPath;

/// 100-ns intervals per second.
const TICKS_PER_SECOND: i64 = 10_000_000;

pub fn to_ticks(time: &DateTime<Utc>) -> i64 {
    time.timestamp() * TICKS_PER_SECOND + i64::from(time.timestamp_subsec_nanos()) / 100
}

pub fn from_ticks(ticks: i64) -> Result<DateTime<Utc>> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = ticks.rem_euclid(TICKS_PER_SECOND) * 100;
    DateTime::from_timestamp(secs, nanos as u32)
        .ok_or_else(|| SyncError::Parse(format!("modified-time out of range: {ticks} ticks")))
}

/// Truncate a timestamp to tick precision so values survive a save/load
/// round trip without drifting under comparison.
pub fn clamp_to_ticks(time: DateTime<Utc>) -> DateTime<Utc> {
    from_ticks(to_ticks(&time)).unwrap_or(time)
}

impl Manifest {
    /// Serialize the manifest. Clears the dirty flag on success.
    pub fn save<W: Write>(&mut self, writer: &mut W) -> Result<()> {
        writeln!(writer, "{}", self.cursor)?;
        writeln!(writer, "{}", self.folders.len())?;
        for (id, path) in &self.folders {
            writeln!(writer, "{id}")?;
            writeln!(writer, "{path}")?;
        }
        writeln!(writer, "{}", self.files.len())?;
        for (id, record) in &self.files {
            writeln!(writer, "{id}")?;
            writeln!(writer, "{}", record.path)?;
            writeln!(writer, "{}", record.size)?;
            writeln!(writer, "{}", to_ticks(&record.modified))?;
            writeln!(writer, "{}", record.checksum)?;
        }
        writer.flush()?;
        self.mark_clean();
        Ok(())
    }

    pub fn load<R: BufRead>(source: RepoTag, reader: R) -> Result<Manifest> {
        let mut lines = reader.lines();
        let mut next = |what: &str| -> Result<String> {
            match lines.next() {
                Some(Ok(line)) => Ok(line),
                Some(Err(err)) => Err(SyncError::Parse(format!("reading {what}: {err}"))),
                None => Err(SyncError::Parse(format!("manifest truncated at {what}"))),
            }
        };

        let mut manifest = Manifest::new(source);
        manifest.cursor = next("cursor")?;

        let folder_count = parse_count(&next("folder count")?, "folder count")?;
        for _ in 0..folder_count {
            let id = next("folder id")?;
            let path = SyncPath::new(next("folder path")?)
                .map_err(|err| SyncError::Parse(format!("folder path: {err}")))?;
            manifest.insert_folder(id, path);
        }

        let file_count = parse_count(&next("file count")?, "file count")?;
        for _ in 0..file_count {
            let id = next("file id")?;
            let path = SyncPath::new(next("file path")?)
                .map_err(|err| SyncError::Parse(format!("file path: {err}")))?;
            let size: i64 = next("file size")?
                .parse()
                .map_err(|err| SyncError::Parse(format!("file size: {err}")))?;
            let ticks: i64 = next("file modified-time")?
                .parse()
                .map_err(|err| SyncError::Parse(format!("file modified-time: {err}")))?;
            let checksum = next("file checksum")?;
            manifest.insert_file(
                id,
                FileRecord {
                    path,
                    size,
                    modified: from_ticks(ticks)?,
                    checksum,
                },
            );
        }

        manifest.mark_clean();
        Ok(manifest)
    }
}

fn parse_count(line: &str, what: &str) -> Result<usize> {
    line.parse()
        .map_err(|err| SyncError::Parse(format!("{what}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn p(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    fn sample() -> Manifest {
        let mut m = Manifest::new(RepoTag::GoogleDrive);
        m.set_cursor("page-token-417");
        m.insert_folder("root", p("My Drive"));
        m.insert_folder("docs", p("My Drive/docs"));
        m.insert_file(
            "f1",
            FileRecord {
                path: p("My Drive/docs/with space.txt"),
                size: 12,
                modified: DateTime::from_timestamp(1_700_000_000, 123_456_700).unwrap(),
                checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            },
        );
        m.insert_file(
            "f2",
            FileRecord {
                path: p("My Drive/unsized.bin"),
                size: -1,
                modified: DateTime::from_timestamp(0, 0).unwrap(),
                checksum: "-".to_string(),
            },
        );
        m
    }

    #[test]
    fn save_load_round_trip() {
        let mut m = sample();
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        assert!(!m.is_dirty());

        let loaded = Manifest::load(RepoTag::GoogleDrive, BufReader::new(&buf[..])).unwrap();
        assert_eq!(loaded, m);
        loaded.check_invariants().unwrap();
    }

    #[test]
    fn empty_manifest_round_trips() {
        let mut m = Manifest::new(RepoTag::LocalDrive);
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let loaded = Manifest::load(RepoTag::LocalDrive, BufReader::new(&buf[..])).unwrap();
        assert_eq!(loaded, m);
        assert_eq!(loaded.cursor(), "");
    }

    #[test]
    fn ticks_round_trip_at_100ns_precision() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let clamped = clamp_to_ticks(t);
        assert_eq!(from_ticks(to_ticks(&clamped)).unwrap(), clamped);
        // Sub-tick nanoseconds are truncated, never rounded up.
        assert!(clamped <= t);

        let pre_epoch = DateTime::from_timestamp(-10, 999_999_900).unwrap();
        assert_eq!(from_ticks(to_ticks(&pre_epoch)).unwrap(), pre_epoch);
    }

    #[test]
    fn truncated_input_fails_the_load() {
        let mut m = sample();
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let cut = &buf[..buf.len() - 10];
        let err = Manifest::load(RepoTag::GoogleDrive, BufReader::new(cut)).unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn garbage_counts_fail_the_load() {
        let text = "cursor\nnot-a-number\n";
        let err =
            Manifest::load(RepoTag::GoogleDrive, BufReader::new(text.as_bytes())).unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn loaded_manifest_is_clean() {
        let mut m = sample();
        let mut buf = Vec::new();
        m.save(&mut buf).unwrap();
        let loaded = Manifest::load(RepoTag::GoogleDrive, BufReader::new(&buf[..])).unwrap();
        assert!(!loaded.is_dirty());
    }
}
