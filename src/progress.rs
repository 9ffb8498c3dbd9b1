// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment progress reporting.
//!
//! Reporters only observe. Nothing a reporter does can change what a
//! deployment does next.

use crate::deploy::DeployPhase;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

/// Observable deployment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployEvent {
    /// Orchestrator entered a new phase.
    Phase(DeployPhase),

    /// Remote entry is about to be removed.
    Removing(String),

    /// Remote entry was renamed.
    Renamed { from: String, to: String },

    /// Remote directory was created.
    Created(String),

    /// File outside the main tree was uploaded.
    ExtraUploaded(String),

    /// Compensating action restored previous release.
    Restored,
}

/// Receive upload progress and deployment events.
pub trait ProgressReporter {
    /// Begin reporting for a known number of units.
    fn start(&mut self, total: u64);

    /// One unit completed.
    fn advance(&mut self, label: &str);

    /// Final unit completed.
    fn finish(&mut self, label: &str);

    /// Report failure that interrupts the run.
    fn interrupt(&mut self, message: &str);

    /// Observe deployment event.
    fn event(&mut self, event: &DeployEvent) {
        debug!("{event:?}");
    }
}

impl<R> ProgressReporter for &mut R
where
    R: ProgressReporter + ?Sized,
{
    fn start(&mut self, total: u64) {
        (**self).start(total);
    }

    fn advance(&mut self, label: &str) {
        (**self).advance(label);
    }

    fn finish(&mut self, label: &str) {
        (**self).finish(label);
    }

    fn interrupt(&mut self, message: &str) {
        (**self).interrupt(message);
    }

    fn event(&mut self, event: &DeployEvent) {
        (**self).event(event);
    }
}

/// Terminal progress bar.
///
/// Renders `[bar] percent file`. Hidden automatically when stderr is not a
/// terminal.
#[derive(Debug, Clone)]
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    /// Construct new progress bar reporter.
    ///
    /// # Errors
    ///
    /// - Return [`indicatif::style::TemplateError`] if bar template is invalid.
    pub fn new() -> Result<Self, indicatif::style::TemplateError> {
        let style = ProgressStyle::with_template("[{bar:20}] {percent:>3}% {msg}")?.progress_chars("█ ");
        let bar = ProgressBar::hidden();
        bar.set_style(style);

        Ok(Self { bar })
    }

    /// Underlying progress bar.
    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl ProgressReporter for BarReporter {
    fn start(&mut self, total: u64) {
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn advance(&mut self, label: &str) {
        self.bar.set_message(label.to_string());
        self.bar.inc(1);
    }

    fn finish(&mut self, label: &str) {
        self.bar.inc(1);
        self.bar.finish_with_message(label.to_string());
    }

    fn interrupt(&mut self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }

    fn event(&mut self, event: &DeployEvent) {
        match event {
            DeployEvent::Phase(phase) => debug!("phase {phase}"),
            DeployEvent::Restored => self.bar.suspend(|| info!("previous release restored")),
            _ => debug!("{event:?}"),
        }
    }
}

/// Reporter that only logs.
///
/// Used where no terminal is attached, e.g., dry runs.
#[derive(Debug, Default, Clone)]
pub struct LogReporter {
    total: u64,
    done: u64,
}

impl ProgressReporter for LogReporter {
    fn start(&mut self, total: u64) {
        self.total = total;
        self.done = 0;
    }

    fn advance(&mut self, label: &str) {
        self.done += 1;
        debug!("[{}/{}] {label}", self.done, self.total);
    }

    fn finish(&mut self, label: &str) {
        self.done += 1;
        info!("[{}/{}] {label}", self.done, self.total);
    }

    fn interrupt(&mut self, message: &str) {
        info!("interrupted: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bar_counts_every_unit() -> anyhow::Result<()> {
        let mut reporter = BarReporter::new()?;
        reporter.start(3);
        reporter.advance("a.txt");
        reporter.advance("b.txt");
        reporter.finish("Upload done");

        assert_eq!(reporter.bar().position(), 3);
        assert_eq!(reporter.bar().length(), Some(3));
        assert!(reporter.bar().is_finished());

        Ok(())
    }

    #[test]
    fn log_reporter_tracks_done_units() {
        let mut reporter = LogReporter::default();
        reporter.start(2);
        reporter.advance("a.txt");
        reporter.finish("Upload done");

        assert_eq!(reporter.done, 2);
    }
}
