use issuebank_common::StopSignal;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::error::{RefreshError, SelectionError};
use crate::height::HeightSource;
use crate::models::Task;
use crate::obfuscate::Obfuscator;
use crate::publisher::TaskPublisher;
use crate::selector::EntrySelector;

#[derive(Clone, Debug)]
pub struct RotationConfig {
    pub threshold: u64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationPhase {
    Idle,
    Refreshing,
}

#[derive(Debug, Default)]
pub struct RotationState {
    last_observed_height: AtomicU64,
    refreshing: AtomicBool,
}

impl RotationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_observed_height(&self) -> u64 {
        self.last_observed_height.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> RotationPhase {
        if self.refreshing.load(Ordering::SeqCst) {
            RotationPhase::Refreshing
        } else {
            RotationPhase::Idle
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.phase() == RotationPhase::Refreshing
    }

    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RefreshGuard { state: self })
    }

    fn record_height(&self, height: u64) {
        self.last_observed_height.fetch_max(height, Ordering::SeqCst);
    }
}

// Clears the flag on drop, so a cancelled refresh never leaves it set.
pub struct RefreshGuard<'a> {
    state: &'a RotationState,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.state.refreshing.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Waiting { height: u64 },
    Busy { height: u64 },
    Refreshed { height: u64, entry_id: String },
    RefreshFailed { height: u64 },
    SourceFailed,
}

pub struct RotationPoller {
    config: RotationConfig,
    state: Arc<RotationState>,
    publisher: Arc<TaskPublisher>,
    selector: EntrySelector,
    heights: Arc<dyn HeightSource>,
    obfuscator: Arc<dyn Obfuscator>,
}

impl RotationPoller {
    pub fn new(
        config: RotationConfig,
        state: Arc<RotationState>,
        publisher: Arc<TaskPublisher>,
        selector: EntrySelector,
        heights: Arc<dyn HeightSource>,
        obfuscator: Arc<dyn Obfuscator>,
    ) -> Self {
        Self {
            config,
            state,
            publisher,
            selector,
            heights,
            obfuscator,
        }
    }

    fn threshold_reached(&self, height: u64) -> bool {
        let last = self.state.last_observed_height();
        height > last && height - last >= self.config.threshold
    }

    pub async fn tick(&self) -> TickOutcome {
        let height = match self.heights.current_height().await {
            Ok(height) => height,
            Err(err) => {
                tracing::warn!(error = %err, "height source read failed");
                return TickOutcome::SourceFailed;
            }
        };

        if !self.threshold_reached(height) {
            return TickOutcome::Waiting { height };
        }

        let _guard = match self.begin_rotation(height) {
            Ok(guard) => guard,
            Err(outcome) => return outcome,
        };

        match self.refresh().await {
            Ok(entry_id) => {
                tracing::info!(height, entry_id = %entry_id, "task rotated");
                TickOutcome::Refreshed { height, entry_id }
            }
            Err(RefreshError::Selection(SelectionError::Exhausted)) => {
                tracing::error!(height, "row store is empty; keeping previous task");
                TickOutcome::RefreshFailed { height }
            }
            Err(err) => {
                tracing::error!(
                    height,
                    error = %err,
                    "task refresh failed; keeping previous task"
                );
                TickOutcome::RefreshFailed { height }
            }
        }
    }

    fn begin_rotation(&self, height: u64) -> Result<RefreshGuard<'_>, TickOutcome> {
        let Some(guard) = self.state.try_begin_refresh() else {
            tracing::debug!(height, "refresh already in progress, trigger dropped");
            return Err(TickOutcome::Busy { height });
        };
        // Another caller may have rotated between the unguarded check and here.
        if !self.threshold_reached(height) {
            return Err(TickOutcome::Waiting { height });
        }
        let previous = self.state.last_observed_height();
        self.state.record_height(height);
        tracing::info!(height, previous, "rotating task");
        Ok(guard)
    }

    async fn refresh(&self) -> Result<String, RefreshError> {
        let entry = self.selector.fetch_unused_entry().await?;
        tracing::info!(entry_id = %entry.id, repo = %entry.repository, "obfuscating entry");
        let problem_text = self.obfuscator.rewrite(&entry.problem_text).await?;
        self.publisher.publish(Task::from_entry(&entry, problem_text));
        Ok(entry.id)
    }

    // An in-flight tick is abandoned at its next suspension point.
    pub async fn run(&self, stop: StopSignal) {
        tracing::info!(
            threshold = self.config.threshold,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            error_backoff_ms = self.config.error_backoff.as_millis() as u64,
            "rotation poller started"
        );
        while !stop.stopped() {
            let outcome = tokio::select! {
                outcome = self.tick() => outcome,
                _ = stop.cancelled() => break,
            };
            let delay = match outcome {
                TickOutcome::SourceFailed => self.config.error_backoff,
                _ => self.config.poll_interval,
            };
            if stop.sleep_or_stop(delay).await {
                break;
            }
        }
        tracing::info!("rotation poller stopped");
    }
}
