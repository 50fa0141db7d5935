use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::router::RouteOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Event,
    Command,
}

/// One inbound action, tracked from arrival to resolution. Never persisted.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub id: Uuid,
    pub direction: String,
    pub kind: RequestKind,
}

impl BridgeRequest {
    pub fn event(direction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: direction.into(),
            kind: RequestKind::Event,
        }
    }

    pub fn command(direction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: direction.into(),
            kind: RequestKind::Command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    VirtualUser,
    NotMapped,
    AlreadySeen,
    AlreadySynced,
    Dropped,
}

impl IgnoreReason {
    fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::VirtualUser => "virtual user",
            IgnoreReason::NotMapped => "not mapped",
            IgnoreReason::AlreadySeen => "already seen",
            IgnoreReason::AlreadySynced => "already synced",
            IgnoreReason::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Success,
    Ignored(IgnoreReason),
    /// A connect that found the group or space already mapped.
    AlreadyMapped,
    PermissionDenied,
    Failed(String),
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Success => f.write_str("SUCCESS"),
            Resolution::Ignored(reason) => write!(f, "IGNORE {}", reason.as_str()),
            Resolution::AlreadyMapped => f.write_str("ALREADY MAPPED"),
            Resolution::PermissionDenied => f.write_str("PERMISSION DENIED"),
            Resolution::Failed(_) => f.write_str("FAILED"),
        }
    }
}

impl From<&RouteOutcome> for Resolution {
    fn from(outcome: &RouteOutcome) -> Self {
        match outcome {
            RouteOutcome::Mirrored { .. } => Resolution::Success,
            RouteOutcome::IgnoredVirtualUser => Resolution::Ignored(IgnoreReason::VirtualUser),
            RouteOutcome::IgnoredNotMapped => Resolution::Ignored(IgnoreReason::NotMapped),
            RouteOutcome::IgnoredAlreadySeen => Resolution::Ignored(IgnoreReason::AlreadySeen),
            RouteOutcome::IgnoredAlreadySynced => Resolution::Ignored(IgnoreReason::AlreadySynced),
            RouteOutcome::SendFailed { reason, .. } => Resolution::Failed(reason.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub success: u64,
    pub ignored: u64,
    pub already_mapped: u64,
    pub permission_denied: u64,
    pub failed: u64,
    pub delayed: u64,
    pub dead: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutLevel {
    Delayed,
    Dead,
}

/// Classifies request outcomes and flags requests that stay unresolved for too long.
pub struct RequestTracker {
    delayed_after: Duration,
    dead_after: Duration,
    stats: Mutex<RequestStats>,
}

impl RequestTracker {
    pub fn new(delayed_after: Duration, dead_after: Duration) -> Self {
        Self {
            delayed_after,
            dead_after,
            stats: Mutex::new(RequestStats::default()),
        }
    }

    pub fn stats(&self) -> RequestStats {
        *self.stats.lock()
    }

    /// Drives `work` to completion. Crossing a threshold is reported but never cancels it.
    pub async fn track<F>(&self, request: &BridgeRequest, work: F) -> Resolution
    where
        F: Future<Output = Resolution>,
    {
        let started = Instant::now();
        let delayed = sleep(self.delayed_after);
        let dead = sleep(self.dead_after);
        tokio::pin!(work, delayed, dead);
        let mut delayed_fired = false;
        let mut dead_fired = false;

        let resolution = loop {
            tokio::select! {
                resolution = &mut work => break resolution,
                _ = &mut delayed, if !delayed_fired => {
                    delayed_fired = true;
                    self.on_timeout(request, TimeoutLevel::Delayed, self.delayed_after);
                }
                _ = &mut dead, if !dead_fired => {
                    dead_fired = true;
                    self.on_timeout(request, TimeoutLevel::Dead, self.dead_after);
                }
            }
        };

        let elapsed = started.elapsed();
        match &resolution {
            Resolution::Failed(reason) => self.on_rejected(request, reason, elapsed),
            other => self.on_resolved(request, other, elapsed),
        }
        resolution
    }

    pub fn on_resolved(&self, request: &BridgeRequest, resolution: &Resolution, elapsed: Duration) {
        let mut stats = self.stats.lock();
        match resolution {
            Resolution::Success => {
                stats.success += 1;
                info!(
                    "request resolved id={} direction={} kind={:?} status={} elapsed_ms={}",
                    request.id,
                    request.direction,
                    request.kind,
                    resolution,
                    elapsed.as_millis()
                );
            }
            Resolution::AlreadyMapped | Resolution::PermissionDenied => {
                if *resolution == Resolution::AlreadyMapped {
                    stats.already_mapped += 1;
                } else {
                    stats.permission_denied += 1;
                }
                info!(
                    "request resolved id={} direction={} kind={:?} status={} elapsed_ms={}",
                    request.id,
                    request.direction,
                    request.kind,
                    resolution,
                    elapsed.as_millis()
                );
            }
            Resolution::Ignored(_) => {
                stats.ignored += 1;
                debug!(
                    "request resolved id={} direction={} kind={:?} status={} elapsed_ms={}",
                    request.id,
                    request.direction,
                    request.kind,
                    resolution,
                    elapsed.as_millis()
                );
            }
            Resolution::Failed(reason) => {
                drop(stats);
                self.on_rejected(request, reason, elapsed);
            }
        }
    }

    pub fn on_rejected(&self, request: &BridgeRequest, reason: &str, elapsed: Duration) {
        self.stats.lock().failed += 1;
        warn!(
            "request resolved id={} direction={} kind={:?} status=FAILED reason={} elapsed_ms={}",
            request.id,
            request.direction,
            request.kind,
            reason,
            elapsed.as_millis()
        );
    }

    pub fn on_timeout(&self, request: &BridgeRequest, level: TimeoutLevel, threshold: Duration) {
        let mut stats = self.stats.lock();
        match level {
            TimeoutLevel::Delayed => {
                stats.delayed += 1;
                warn!(
                    "request still pending id={} direction={} status=DELAYED threshold_ms={}",
                    request.id,
                    request.direction,
                    threshold.as_millis()
                );
            }
            TimeoutLevel::Dead => {
                stats.dead += 1;
                error!(
                    "request still pending id={} direction={} status=DEAD threshold_ms={}",
                    request.id,
                    request.direction,
                    threshold.as_millis()
                );
            }
        }
    }
}
