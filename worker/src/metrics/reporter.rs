use std::{fmt, num::NonZeroUsize, time::Instant};

use log::{debug, warn};

use super::{SummaryRecord, SummaryValues, SummaryWriter};
use crate::cluster::TaskIndex;

/// The metrics of a single report window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    pub global_step: u64,
    pub average_loss: f32,
    pub steps_per_second: f32,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] loss={:.2}, steps/s={:.2}",
            self.global_step, self.average_loss, self.steps_per_second
        )
    }
}

/// Averages the loss over windows of `report_frequency` local steps and measures the
/// cluster's throughput over each of them.
pub struct MetricsReporter {
    report_frequency: NonZeroUsize,
    task: TaskIndex,
    writer: Option<SummaryWriter>,
    accumulated: f64,
    steps: usize,
    prev_step: u64,
    prev_instant: Instant,
}

impl MetricsReporter {
    /// Creates a new `MetricsReporter`.
    ///
    /// # Arguments
    /// * `report_frequency` - The amount of local steps per report.
    /// * `start_step` - The global step when training started.
    /// * `start` - The instant training started.
    /// * `task` - This process' task index.
    /// * `writer` - Where to persist every report, if anywhere.
    pub fn new(
        report_frequency: NonZeroUsize,
        start_step: u64,
        start: Instant,
        task: TaskIndex,
        writer: Option<SummaryWriter>,
    ) -> Self {
        Self {
            report_frequency,
            task,
            writer,
            accumulated: 0.,
            steps: 0,
            prev_step: start_step,
            prev_instant: start,
        }
    }

    /// Accumulates the loss of a local step.
    ///
    /// # Returns
    /// The report if this step closed a window.
    pub fn update(&mut self, loss: f32, global_step: u64) -> Option<Report> {
        self.update_at(loss, global_step, Instant::now())
    }

    /// Same as `update`, using `now` as the current instant.
    pub fn update_at(&mut self, loss: f32, global_step: u64, now: Instant) -> Option<Report> {
        self.accumulated += loss as f64;
        self.steps += 1;

        if self.steps < self.report_frequency.get() {
            self.flush_summaries(now);
            return None;
        }

        let elapsed = now.saturating_duration_since(self.prev_instant).as_secs_f64();
        let advanced = global_step.saturating_sub(self.prev_step);

        let steps_per_second = if elapsed > 0. {
            advanced as f64 / elapsed
        } else {
            0.
        };

        let report = Report {
            global_step,
            average_loss: (self.accumulated / self.steps as f64) as f32,
            steps_per_second: steps_per_second as f32,
        };

        println!("{report}");
        self.persist(&report, now);

        self.accumulated = 0.;
        self.steps = 0;
        self.prev_step = global_step;
        self.prev_instant = now;

        Some(report)
    }

    fn flush_summaries(&mut self, now: Instant) {
        let Some(writer) = &mut self.writer else {
            return;
        };

        if let Err(e) = writer.flush_if_due_at(now) {
            warn!(task = self.task.get(); "failed to flush summaries: {e}");
        }
    }

    fn persist(&mut self, report: &Report, now: Instant) {
        let Some(writer) = &mut self.writer else {
            return;
        };

        let values = SummaryValues {
            loss: report.average_loss,
            steps_per_second: report.steps_per_second,
        };

        let record = SummaryRecord::now(report.global_step, self.task, values);

        if let Err(e) = writer.write_at(&record, now) {
            warn!(task = self.task.get(); "failed to write summary: {e}");
        }
    }

    /// Closes the summary writer. The partial window is dropped.
    pub fn close(self) {
        if self.steps > 0 {
            debug!(task = self.task.get(), steps = self.steps; "dropping partial report window");
        }

        if let Some(Err(e)) = self.writer.map(SummaryWriter::close) {
            warn!(task = self.task.get(); "failed to close summaries: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn reporter(freq: usize, start_step: u64, start: Instant) -> MetricsReporter {
        let freq = NonZeroUsize::new(freq).unwrap();
        MetricsReporter::new(freq, start_step, start, TaskIndex::LEADER, None)
    }

    #[test]
    fn reports_on_every_window_boundary() {
        let start = Instant::now();
        let mut reporter = reporter(100, 0, start);

        for step in 1..100 {
            assert!(reporter.update_at(1.0, step, start).is_none());
        }

        let report = reporter
            .update_at(1.0, 100, start + Duration::from_secs(10))
            .unwrap();

        assert_eq!(report.global_step, 100);
        assert_eq!(report.average_loss, 1.0);
        assert_eq!(report.steps_per_second, 10.0);
        assert_eq!(report.to_string(), "[100] loss=1.00, steps/s=10.00");
    }

    #[test]
    fn throughput_counts_every_worker() {
        let start = Instant::now();
        let mut reporter = reporter(2, 10, start);

        reporter.update_at(0.5, 13, start);
        let report = reporter
            .update_at(1.5, 30, start + Duration::from_secs(2))
            .unwrap();

        assert_eq!(report.average_loss, 1.0);
        assert_eq!(report.steps_per_second, 10.0);

        // the next window starts where the last one ended
        reporter.update_at(1.0, 31, start + Duration::from_secs(3));
        let report = reporter
            .update_at(1.0, 40, start + Duration::from_secs(4))
            .unwrap();

        assert_eq!(report.steps_per_second, 5.0);
    }

    #[test]
    fn throughput_is_never_negative() {
        let start = Instant::now();
        let mut reporter = reporter(1, 50, start);

        let report = reporter.update_at(2.0, 40, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.steps_per_second, 0.0);

        let report = reporter.update_at(2.0, 41, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.steps_per_second, 0.0);
        assert_eq!(report.to_string(), "[41] loss=2.00, steps/s=0.00");
    }

    #[test]
    fn summaries_are_flushed_between_report_windows() {
        let dir = TempDir::new().unwrap();
        let task = TaskIndex::new(1);
        let period = Duration::from_secs(20);
        let writer = SummaryWriter::open(dir.path(), task, period).unwrap();
        let path = writer.path().to_path_buf();
        let read = || std::fs::read_to_string(&path).unwrap();

        let start = Instant::now();
        let freq = NonZeroUsize::new(3).unwrap();
        let mut reporter = MetricsReporter::new(freq, 0, start, task, Some(writer));

        for step in 1..=3 {
            reporter.update_at(1.0, step, start + Duration::from_secs(step));
        }
        assert!(read().is_empty());

        // the next window is far from closed, the flush period alone writes the report
        assert!(reporter.update_at(1.0, 4, start + period + Duration::from_secs(5)).is_none());
        assert_eq!(read().lines().count(), 1);

        reporter.close();
    }

    #[test]
    fn reports_are_persisted_once_closed() {
        let dir = TempDir::new().unwrap();
        let task = TaskIndex::new(2);
        let writer = SummaryWriter::open(dir.path(), task, Duration::from_secs(3600)).unwrap();
        let path = writer.path().to_path_buf();

        let start = Instant::now();
        let freq = NonZeroUsize::new(2).unwrap();
        let mut reporter = MetricsReporter::new(freq, 0, start, task, Some(writer));

        for step in 1..=5 {
            reporter.update_at(0.25, step, start + Duration::from_secs(step));
        }

        reporter.close();

        let records: Vec<SummaryRecord> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step, 2);
        assert_eq!(records[1].step, 4);
        assert_eq!(records[1].task, 2);
        assert_eq!(records[1].values.loss, 0.25);
        assert_eq!(records[1].values.steps_per_second, 1.0);
    }
}
