//! Scheduling handle for one rule.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::window::EvaluationWindow;

/// Window state carried between ticks of one job.
///
/// The job is the only place windows are computed. Each tick looks back
/// over the rule's buffer from `now`. When the previous tick continued an
/// open incident, the next tick starts at that tick's end instead, so the
/// documents already grouped into the incident are not scanned again. The
/// resume point is used once and never reaches further back than the
/// buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobWindow {
    last: Option<EvaluationWindow>,
    resume_from: Option<DateTime<Utc>>,
}

impl JobWindow {
    /// Computes and records the window for a tick at `now`.
    pub fn next(&mut self, now: DateTime<Utc>, lookback: TimeDelta) -> EvaluationWindow {
        let mut window = EvaluationWindow::trailing(now, lookback);
        if let Some(resume) = self.resume_from.take() {
            if resume > window.start && resume < now {
                window.start = resume;
            }
        }
        self.last = Some(window);
        window
    }

    /// Makes the next tick start at `end`.
    pub fn resume_from(&mut self, end: DateTime<Utc>) {
        self.resume_from = Some(end);
    }

    /// The most recent window, if any tick ran.
    #[must_use]
    pub const fn last(&self) -> Option<EvaluationWindow> {
        self.last
    }

    /// Pending resume point.
    #[must_use]
    pub const fn pending_resume(&self) -> Option<DateTime<Utc>> {
        self.resume_from
    }
}

/// A rule's periodic task plus the state it carries between ticks.
#[derive(Debug)]
pub struct Job {
    rule_id: String,
    generation: u64,
    window: Mutex<JobWindow>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Job {
    /// Creates a job that is not running yet.
    #[must_use]
    pub fn new(rule_id: impl Into<String>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            rule_id: rule_id.into(),
            generation,
            window: Mutex::new(JobWindow::default()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Rule this job evaluates.
    #[must_use]
    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    /// Generation stamped on the job at creation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when the job stops.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the job was stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops future ticks. A tick already running completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Computes the next window.
    pub fn next_window(&self, now: DateTime<Utc>, lookback: TimeDelta) -> EvaluationWindow {
        self.window.lock().next(now, lookback)
    }

    /// Sets the resume point for the next tick.
    pub fn advance(&self, end: DateTime<Utc>) {
        self.window.lock().resume_from(end);
    }

    /// Copy of the window state.
    #[must_use]
    pub fn window_state(&self) -> JobWindow {
        self.window.lock().clone()
    }

    /// Attaches the spawned task.
    pub fn attach(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    /// Returns true if a task is attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Detaches the task handle so the caller can await it.
    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }
}
