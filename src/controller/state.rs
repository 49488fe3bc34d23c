//! Charm lifecycle states
//!
//! The charm moves `Uninitialized → Installing → Waiting{reason} → Active`.
//! A waiting reason is observability only: any waiting charm transitions
//! back toward installing/active once the blocking condition clears and the
//! deferred event is redelivered.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::info;

/// Why the charm is waiting rather than progressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// This unit is not the application leader.
    NoLeadership,
    /// The cluster denied the permission probe.
    AuthDenied,
    /// The candidate configuration failed validation.
    InvalidConfig,
    /// The workload container's supervisor is not reachable yet.
    ContainerUnreachable,
    /// The prerequisite cluster role does not exist.
    RbacMissing,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::NoLeadership => write!(f, "waiting for leadership"),
            WaitReason::AuthDenied => {
                write!(f, "insufficient cluster permissions, grant the operator cluster access")
            }
            WaitReason::InvalidConfig => write!(f, "waiting for a valid configuration"),
            WaitReason::ContainerUnreachable => {
                write!(f, "pebble socket not available, waiting for the container")
            }
            WaitReason::RbacMissing => {
                write!(f, "cluster-admin role not found, RBAC must be enabled")
            }
        }
    }
}

/// Overall charm status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharmStatus {
    Uninitialized,
    /// Creating cluster resources.
    Installing,
    Waiting(WaitReason),
    Active,
}

impl CharmStatus {
    /// Active is the only status the readiness probe reports as ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, CharmStatus::Active)
    }
}

impl fmt::Display for CharmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharmStatus::Uninitialized => write!(f, "uninitialized"),
            CharmStatus::Installing => write!(f, "installing"),
            CharmStatus::Waiting(reason) => write!(f, "waiting: {}", reason),
            CharmStatus::Active => write!(f, "active"),
        }
    }
}

/// Tracks the current status and when it was entered.
#[derive(Clone, Debug)]
pub struct StatusLog {
    current: CharmStatus,
    since: DateTime<Utc>,
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLog {
    pub fn new() -> Self {
        Self {
            current: CharmStatus::Uninitialized,
            since: Utc::now(),
        }
    }

    pub fn current(&self) -> CharmStatus {
        self.current
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Record a transition; same-status updates keep the original timestamp.
    pub fn set(&mut self, next: CharmStatus) {
        if self.current != next {
            info!(from = %self.current, to = %next, "status changed");
            self.current = next;
            self.since = Utc::now();
        }
    }
}
