use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::cluster::TaskIndex;

/// The values reported at a report boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryValues {
    pub loss: f32,
    pub steps_per_second: f32,
}

/// A single line of the metrics log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Seconds since the unix epoch.
    pub wall_time: f64,
    pub step: u64,
    pub task: usize,
    pub values: SummaryValues,
}

impl SummaryRecord {
    /// Creates a record stamped with the current wall time.
    pub fn now(step: u64, task: TaskIndex, values: SummaryValues) -> Self {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0., |d| d.as_secs_f64());

        Self {
            wall_time,
            step,
            task: task.get(),
            values,
        }
    }
}

/// Appends summary records to `<log_dir>/w<task>/events.jsonl`.
///
/// Records are buffered and flushed once `flush_period` elapsed since the last flush,
/// and when the writer is closed. The owner drives the clock through `flush_if_due`,
/// the `MetricsReporter` does it on every step.
pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
    flush_period: Duration,
    last_flush: Instant,
    pending: usize,
}

impl SummaryWriter {
    pub const FILE_NAME: &str = "events.jsonl";

    /// Opens the metrics log of `task`, creating it if needed.
    ///
    /// # Arguments
    /// * `log_dir` - The experiment's log directory.
    /// * `task` - This process' task index.
    /// * `flush_period` - The maximum time records stay buffered.
    ///
    /// # Returns
    /// The writer or an io error if the log can't be opened.
    pub fn open(
        log_dir: impl AsRef<Path>,
        task: TaskIndex,
        flush_period: Duration,
    ) -> io::Result<Self> {
        let dir = Self::dir(log_dir, task);
        fs::create_dir_all(&dir)?;

        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
            flush_period,
            last_flush: Instant::now(),
            pending: 0,
        })
    }

    /// The directory the metrics of `task` are written to.
    pub fn dir(log_dir: impl AsRef<Path>, task: TaskIndex) -> PathBuf {
        log_dir.as_ref().join(format!("w{task}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffers a record, flushing if the flush period elapsed.
    pub fn write(&mut self, record: &SummaryRecord) -> io::Result<()> {
        self.write_at(record, Instant::now())
    }

    /// Same as `write`, using `now` as the current instant.
    pub fn write_at(&mut self, record: &SummaryRecord, now: Instant) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.pending += 1;

        self.flush_if_due_at(now)
    }

    /// Flushes the buffered records if the flush period elapsed since the last flush.
    pub fn flush_if_due(&mut self) -> io::Result<()> {
        self.flush_if_due_at(Instant::now())
    }

    /// Same as `flush_if_due`, using `now` as the current instant.
    pub fn flush_if_due_at(&mut self, now: Instant) -> io::Result<()> {
        if self.pending > 0 && now.saturating_duration_since(self.last_flush) >= self.flush_period
        {
            self.flush_at(now)?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.flush_at(Instant::now())
    }

    fn flush_at(&mut self, now: Instant) -> io::Result<()> {
        self.out.flush()?;
        self.last_flush = now;
        debug!(records = self.pending; "flushed summaries to {}", self.path.display());
        self.pending = 0;
        Ok(())
    }

    /// Flushes every buffered record and closes the log.
    pub fn close(mut self) -> io::Result<()> {
        self.flush()
    }
}
