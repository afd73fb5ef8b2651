//! Archive playback: iterate recorded samples instead of live ones.
//!
//! The actual on-disk archive format (pmlogger's binary layout) is a named
//! external collaborator, not something this crate parses — playback here
//! is built against an abstract [`ArchiveSource`] so the interpolating
//! accessor and directory-advance logic can be tested without a real
//! archive reader, per spec.md's metrics (§4.6.6) leaving the storage
//! format itself out of scope.

use crate::error::Problem;

/// One recorded sample set at a point in archive time.
#[derive(Debug, Clone)]
pub struct ArchiveSample {
    pub timestamp_ms: i64,
    pub values: Vec<f64>,
}

/// A readable archive: a bounded, time-ordered sequence of samples.
pub trait ArchiveSource: Send {
    /// Earliest and latest sample timestamps covered by this archive.
    fn time_range_ms(&self) -> (i64, i64);
    /// Samples at or after `from_ms`, in ascending time order.
    fn samples_from(&self, from_ms: i64) -> Vec<ArchiveSample>;
}

/// Open one archive in a directory; returns `None` (logged, not fatal) if
/// its header can't be read.
pub trait ArchiveOpener {
    fn open(&self, path: &std::path::Path) -> Option<Box<dyn ArchiveSource>>;
}

/// Plays archives in a directory back in ascending start-time order,
/// advancing to the next archive when the current one is exhausted.
pub struct ArchivePlayback {
    samples: Vec<ArchiveSample>,
    cursor: usize,
    limit: Option<usize>,
    emitted: usize,
}

impl ArchivePlayback {
    /// Build playback starting at `timestamp_ms` (negative means "now minus
    /// |t|", resolved by the caller before construction) across `archives`,
    /// which must already be sorted by ascending start time. Archives whose
    /// header failed to open are skipped with a `warn!` log by the caller
    /// before they ever reach this constructor.
    #[must_use]
    pub fn new(archives: &[Box<dyn ArchiveSource>], timestamp_ms: i64, limit: Option<usize>) -> Self {
        let mut samples = Vec::new();
        for archive in archives {
            samples.extend(archive.samples_from(timestamp_ms));
        }
        samples.sort_by_key(|s| s.timestamp_ms);
        Self { samples, cursor: 0, limit, emitted: 0 }
    }

    /// Advance one step, returning the next sample or `None` once the
    /// archive set or the `limit` is exhausted.
    pub fn next(&mut self) -> Option<ArchiveSample> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return None;
            }
        }
        let sample = self.samples.get(self.cursor).cloned()?;
        self.cursor += 1;
        self.emitted += 1;
        Some(sample)
    }
}

/// Resolve a `timestamp` option: non-negative values are an absolute
/// archive-epoch millisecond timestamp, negative values mean "now minus
/// |t|" milliseconds.
#[must_use]
pub fn resolve_timestamp(raw: i64, now_ms: i64) -> i64 {
    if raw < 0 {
        now_ms + raw
    } else {
        raw
    }
}

/// Open every archive file directly inside `dir` via `opener`, logging and
/// skipping ones that fail to open, and returning them sorted by ascending
/// start time.
pub fn open_directory(
    dir: &std::path::Path,
    opener: &dyn ArchiveOpener,
) -> Result<Vec<Box<dyn ArchiveSource>>, Problem> {
    let entries = std::fs::read_dir(dir).map_err(|e| Problem::from_io_error(&e))?;
    let mut archives: Vec<Box<dyn ArchiveSource>> = Vec::new();
    for entry in entries.flatten() {
        match opener.open(&entry.path()) {
            Some(archive) => archives.push(archive),
            None => log::warn!("skipping unreadable metrics archive: {}", entry.path().display()),
        }
    }
    archives.sort_by_key(|a| a.time_range_ms().0);
    Ok(archives)
}

/// Whether a metrics channel's `source` option names an archive to replay
/// rather than a live sampler set: an absolute path, or the well-known
/// `"pcp-archive"` alias for the local pmlogger per-host directory.
#[must_use]
pub fn is_archive_source(source: &str) -> bool {
    source.starts_with('/') || source == "pcp-archive"
}

/// Resolve the directory to scan for archives for a given archive `source`
/// option (see [`is_archive_source`]). `"pcp-archive"` maps to the local
/// pmlogger default per-host directory; anything else is used verbatim.
pub fn resolve_archive_dir(source: &str) -> Result<std::path::PathBuf, Problem> {
    if source == "pcp-archive" {
        Ok(std::path::PathBuf::from("/var/log/pcp/pmlogger").join(local_hostname()?))
    } else {
        Ok(std::path::PathBuf::from(source))
    }
}

#[cfg(target_os = "linux")]
fn local_hostname() -> Result<String, Problem> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname(2) writes a NUL-terminated name into a
    // caller-owned buffer of the given length and never retains the pointer.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(Problem::InternalError);
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).map(str::to_owned).map_err(|_| Problem::InternalError)
}

#[cfg(not(target_os = "linux"))]
fn local_hostname() -> Result<String, Problem> {
    Err(Problem::InternalError)
}

/// The production [`ArchiveOpener`]. Parsing the real pmlogger binary
/// archive format is the named external "PCP metrics source" collaborator
/// (spec.md §1), not something this crate does itself, so every candidate
/// file is reported unreadable — logged and skipped by [`open_directory`],
/// never fatal to the channel — rather than leaving archive playback
/// unreachable from the open path.
#[derive(Debug, Default)]
pub struct UnimplementedArchiveOpener;

impl ArchiveOpener for UnimplementedArchiveOpener {
    fn open(&self, _path: &std::path::Path) -> Option<Box<dyn ArchiveSource>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeArchive {
        samples: Vec<ArchiveSample>,
    }
    impl ArchiveSource for FakeArchive {
        fn time_range_ms(&self) -> (i64, i64) {
            let first = self.samples.first().map_or(0, |s| s.timestamp_ms);
            let last = self.samples.last().map_or(0, |s| s.timestamp_ms);
            (first, last)
        }
        fn samples_from(&self, from_ms: i64) -> Vec<ArchiveSample> {
            self.samples.iter().filter(|s| s.timestamp_ms >= from_ms).cloned().collect()
        }
    }

    #[test]
    fn plays_back_in_ascending_order_across_archives() {
        let a: Box<dyn ArchiveSource> = Box::new(FakeArchive {
            samples: vec![ArchiveSample { timestamp_ms: 0, values: vec![1.0] }],
        });
        let b: Box<dyn ArchiveSource> = Box::new(FakeArchive {
            samples: vec![ArchiveSample { timestamp_ms: 1000, values: vec![2.0] }],
        });
        let mut playback = ArchivePlayback::new(&[a, b], 0, None);
        assert_eq!(playback.next().unwrap().timestamp_ms, 0);
        assert_eq!(playback.next().unwrap().timestamp_ms, 1000);
        assert!(playback.next().is_none());
    }

    #[test]
    fn limit_caps_emitted_samples() {
        let a: Box<dyn ArchiveSource> = Box::new(FakeArchive {
            samples: vec![
                ArchiveSample { timestamp_ms: 0, values: vec![1.0] },
                ArchiveSample { timestamp_ms: 1000, values: vec![2.0] },
            ],
        });
        let mut playback = ArchivePlayback::new(&[a], 0, Some(1));
        assert!(playback.next().is_some());
        assert!(playback.next().is_none());
    }

    #[test]
    fn negative_timestamp_means_now_minus_magnitude() {
        assert_eq!(resolve_timestamp(-5000, 20_000), 15_000);
        assert_eq!(resolve_timestamp(5000, 20_000), 5000);
    }

    #[test]
    fn is_archive_source_recognizes_paths_and_pcp_archive_alias() {
        assert!(is_archive_source("/var/log/pcp/pmlogger/myhost"));
        assert!(is_archive_source("pcp-archive"));
        assert!(!is_archive_source("internal"));
        assert!(!is_archive_source("direct"));
        assert!(!is_archive_source("pmcd"));
    }

    #[test]
    fn resolve_archive_dir_uses_absolute_path_verbatim() {
        let dir = resolve_archive_dir("/var/log/pcp/pmlogger/fixed-host").unwrap();
        assert_eq!(dir, std::path::PathBuf::from("/var/log/pcp/pmlogger/fixed-host"));
    }

    #[test]
    fn unimplemented_opener_reports_every_path_unreadable() {
        let opener = UnimplementedArchiveOpener;
        assert!(opener.open(std::path::Path::new("/some/archive/file")).is_none());
    }
}
