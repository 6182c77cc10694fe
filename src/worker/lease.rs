//! Lease lifecycle state machine.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::types::LockedTask;
use crate::error::CodecError;
use crate::variables::{codec, TypedValue, VariableDto, Variables};

/// State of a lease held by this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    /// Locked by fetch-and-lock, not yet dispatched.
    Locked,
    /// Executor subprocess is running.
    Running,
    /// Terminal: completed successfully (or via COMPLETE policy).
    Completed,
    /// Terminal: reported as a task failure.
    Failed,
    /// Terminal: reported as a BPMN error.
    ErrorReported,
    /// Terminal: the engine reclaimed the lease (404/409 on extend or
    /// report); abandoned without a terminal call.
    Lost,
    /// Terminal: a terminal report was permanently rejected; the engine
    /// will reclaim via lock expiry.
    Orphaned,
}

impl LeaseState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: LeaseState) -> bool {
        use LeaseState::*;

        matches!(
            (self, target),
            (Locked, Running)
                | (Locked, Failed)
                | (Locked, Lost)
                | (Locked, Orphaned)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, ErrorReported)
                | (Running, Lost)
                | (Running, Orphaned)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Locked | Self::Running)
    }

    /// States that ended with a report call reaching the engine.
    pub fn was_reported(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::ErrorReported)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ErrorReported => "error_reported",
            Self::Lost => "lost",
            Self::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

/// An external task locked by this worker, from lock to terminal report.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Engine-assigned external task id.
    pub id: String,
    pub topic: String,
    pub process_instance_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub activity_id: Option<String>,
    pub business_key: Option<String>,
    pub variables: Variables,
    /// Wall-clock lock expiry; only ever extended, never shortened.
    pub lock_expires_at: DateTime<Utc>,
    /// Remaining retries as reported by the engine; `None` means the
    /// engine has no count yet and the first failure sets the budget.
    pub retries: Option<i32>,
    state: LeaseState,
}

impl Lease {
    /// Decode a locked task from a fetch response. `default_lock` covers
    /// responses without a parseable expiration time.
    pub fn from_locked(task: LockedTask, default_lock: Duration) -> Result<Self, CodecError> {
        let mut variables = HashMap::new();
        for (name, dto) in task.variables.unwrap_or_default() {
            variables.insert(name, codec::decode(&dto)?);
        }

        let lock_expires_at = task
            .lock_expiration_time
            .as_deref()
            .and_then(|raw| codec::parse_engine_date(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + default_lock);

        Ok(Self {
            id: task.id,
            topic: task.topic_name,
            process_instance_id: task.process_instance_id,
            process_definition_key: task.process_definition_key,
            activity_id: task.activity_id,
            business_key: task.business_key,
            variables,
            lock_expires_at,
            retries: task.retries,
            state: LeaseState::Locked,
        })
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, target: LeaseState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "lease {}: cannot transition from {} to {}",
                self.id, self.state, target
            ));
        }
        self.state = target;
        Ok(())
    }

    /// Record a granted lock extension. The expiry is monotonic: an
    /// extension that would shorten the lease is ignored.
    pub fn record_extension(&mut self, new_expiry: DateTime<Utc>) {
        if new_expiry > self.lock_expires_at {
            self.lock_expires_at = new_expiry;
        }
    }

    /// Time left on the lock, zero if already expired.
    pub fn remaining_lock(&self, now: DateTime<Utc>) -> Duration {
        (self.lock_expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Look up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&TypedValue> {
        self.variables.get(name)
    }
}

/// The single report issued for a lease at the end of its lifecycle.
/// Exactly one of these is sent per lease; `Abandon` is the lease-lost
/// path where no call is made at all.
#[derive(Debug)]
pub enum TerminalReport {
    Complete {
        variables: HashMap<String, VariableDto>,
        local_variables: HashMap<String, VariableDto>,
    },
    Failure {
        error_message: String,
        error_details: String,
        retries: i32,
        retry_timeout: Duration,
    },
    BpmnError {
        error_code: String,
        error_message: String,
        variables: HashMap<String, VariableDto>,
    },
    /// Lease lost mid-flight; silently abandoned.
    Abandon,
}

impl TerminalReport {
    /// The terminal state this report lands the lease in once accepted.
    pub fn target_state(&self) -> LeaseState {
        match self {
            Self::Complete { .. } => LeaseState::Completed,
            Self::Failure { .. } => LeaseState::Failed,
            Self::BpmnError { .. } => LeaseState::ErrorReported,
            Self::Abandon => LeaseState::Lost,
        }
    }
}
