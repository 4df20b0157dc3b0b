//! Progress signal for UI consumption
//!
//! Every submission walks the same five phases. A reporter never goes
//! backwards, even when a retry re-enters an earlier phase.

use crate::tx::types::TxHash;

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Preparing,
    Estimating,
    Dispatching,
    Confirming,
    Done,
    Failed,
}

impl ProgressStage {
    /// Nominal completion percentage
    pub fn percent(&self) -> u8 {
        match self {
            ProgressStage::Preparing => 10,
            ProgressStage::Estimating => 30,
            ProgressStage::Dispatching => 50,
            ProgressStage::Confirming => 75,
            ProgressStage::Done | ProgressStage::Failed => 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub stage: ProgressStage,
    pub percent: u8,
    pub message: String,
    pub tx_hash: Option<TxHash>,
}

pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Emits monotonic progress to an optional callback
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    percent: AtomicU8,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            percent: AtomicU8::new(0),
        }
    }

    /// Report a stage; ignored if it would move progress backwards
    pub fn report(&self, stage: ProgressStage, message: impl Into<String>, tx_hash: Option<&TxHash>) {
        let Some(callback) = &self.callback else {
            return;
        };

        let percent = stage.percent();
        let previous = self.percent.fetch_max(percent, Ordering::SeqCst);
        // Repeats are dropped too, so there is only one terminal report
        if percent <= previous {
            return;
        }

        callback(&Progress {
            stage,
            percent,
            message: message.into(),
            tx_hash: tx_hash.cloned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (ProgressReporter, Arc<Mutex<Vec<Progress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p: &Progress| sink.lock().unwrap().push(p.clone()));
        (ProgressReporter::new(Some(callback)), seen)
    }

    #[test]
    fn test_progress_never_goes_backwards() {
        let (reporter, seen) = recording();
        reporter.report(ProgressStage::Preparing, "preparing", None);
        reporter.report(ProgressStage::Estimating, "estimating", None);
        reporter.report(ProgressStage::Dispatching, "dispatching", None);
        // Retry re-enters estimation
        reporter.report(ProgressStage::Estimating, "estimating again", None);
        reporter.report(ProgressStage::Dispatching, "dispatching again", None);
        reporter.report(ProgressStage::Done, "done", None);
        reporter.report(ProgressStage::Failed, "late", None);

        let stages: Vec<_> = seen.lock().unwrap().iter().map(|p| p.stage).collect();
        assert_eq!(
            stages,
            vec![
                ProgressStage::Preparing,
                ProgressStage::Estimating,
                ProgressStage::Dispatching,
                ProgressStage::Done
            ]
        );
    }

    #[test]
    fn test_no_callback_is_silent() {
        let reporter = ProgressReporter::new(None);
        reporter.report(ProgressStage::Done, "done", None);
    }
}
