//! Operator-facing progress lines.
//!
//! Each step prints its title followed by a coloured marker once it
//! finishes. Structured diagnostics go through `tracing` instead.

use std::io::Write;

use colored::Colorize;

use crate::step::{Advisory, StepOutcome};

/// Marker printed after a step title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// The step changed the host.
    Ok,
    /// The step failed and the run stops.
    Fail,
    /// Nothing to do, or left for the operator.
    Skipped,
    /// Soft failure; the run continues.
    Warn,
}

impl Mark {
    /// Plain label for the marker.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
            Self::Warn => "WARN",
        }
    }
}

/// Recorded status of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    /// Probe found the desired state.
    Unchanged,
    /// Mutation applied.
    Changed,
    /// Soft failure with operator guidance.
    SoftFailure(Advisory),
    /// Manual follow-up required.
    NeedsOperator(Advisory),
    /// Hard failure; carries the rendered error.
    Failed(String),
}

impl StepStatus {
    /// Marker shown for this status.
    #[must_use]
    pub const fn mark(&self) -> Mark {
        match self {
            Self::Unchanged | Self::NeedsOperator(_) => Mark::Skipped,
            Self::Changed => Mark::Ok,
            Self::SoftFailure(_) => Mark::Warn,
            Self::Failed(_) => Mark::Fail,
        }
    }
}

impl From<StepOutcome> for StepStatus {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Unchanged => Self::Unchanged,
            StepOutcome::Changed => Self::Changed,
            StepOutcome::SoftFailure(advisory) => Self::SoftFailure(advisory),
            StepOutcome::NeedsOperator(advisory) => Self::NeedsOperator(advisory),
        }
    }
}

/// Receives step progress.
pub trait Reporter {
    /// A step with `title` is about to run.
    fn started(&mut self, title: &str);
    /// The step with `title` finished with `mark`.
    fn finished(&mut self, title: &str, mark: Mark);
}

/// Writes `title... MARK` lines to a writer, usually stdout.
#[derive(Debug)]
pub struct ConsoleReporter<W: Write> {
    out: W,
}

impl<W: Write> ConsoleReporter<W> {
    /// Creates a reporter writing to `out`.
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Reporter for ConsoleReporter<W> {
    fn started(&mut self, title: &str) {
        write!(self.out, "{title}... ").ok();
        self.out.flush().ok();
    }

    fn finished(&mut self, _title: &str, mark: Mark) {
        let label = mark.label();
        let painted = match mark {
            Mark::Ok => label.green(),
            Mark::Fail => label.red(),
            Mark::Skipped => label.cyan(),
            Mark::Warn => label.yellow(),
        };
        writeln!(self.out, "{painted}").ok();
    }
}

/// Keeps `(title, mark)` pairs in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    /// Finished steps in order.
    pub lines: Vec<(String, Mark)>,
}

impl Reporter for RecordingReporter {
    fn started(&mut self, _title: &str) {}

    fn finished(&mut self, title: &str, mark: Mark) {
        self.lines.push((title.to_owned(), mark));
    }
}
