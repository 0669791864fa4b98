//! Generation jobs and their lifecycle state machine.
//!
//! ```text
//! SUBMITTED -> TEXT_READY -> PARTIAL_READY -> SUCCEEDED | FAILED | TIMED_OUT
//! ```
//!
//! The intermediate states are optional and may be skipped. Transitions are
//! monotonic: an observation ranked at or below the current state, or any
//! observation once a terminal state is reached, is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, ProviderJobId, ProviderKind, UserId};

/// Internal job state, independent of any provider vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Accepted, waiting on the provider.
    Submitted,
    /// Lyrics or prompt text produced.
    TextReady,
    /// At least one variant of a multi-variant job produced.
    PartialReady,
    /// Completed with a result.
    Succeeded,
    /// Provider reported failure or rejected the request.
    Failed,
    /// No terminal answer within the polling budget.
    TimedOut,
}

impl JobState {
    /// Position in the lifecycle. All terminal states share the top rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::TextReady => 1,
            Self::PartialReady => 2,
            Self::Succeeded | Self::Failed | Self::TimedOut => 3,
        }
    }

    /// Whether no further transitions are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Whether settlement must return the reserved units.
    #[must_use]
    pub const fn requires_refund(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Stable storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::TextReady => "TEXT_READY",
            Self::PartialReady => "PARTIAL_READY",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Parse the storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUBMITTED" => Some(Self::Submitted),
            "TEXT_READY" => Some(Self::TextReady),
            "PARTIAL_READY" => Some(Self::PartialReady),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "TIMED_OUT" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Non-terminal states, in lifecycle order.
    pub const ACTIVE: [Self; 3] = [Self::Submitted, Self::TextReady, Self::PartialReady];
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider status report translated into the internal vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observed state.
    pub state: JobState,

    /// Result artifacts (URLs, track metadata), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<serde_json::Value>,

    /// Failure reason reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Observation {
    /// Observation carrying only a state.
    #[must_use]
    pub const fn state(state: JobState) -> Self {
        Self {
            state,
            result_payload: None,
            failure_reason: None,
        }
    }

    /// Successful completion with a payload.
    #[must_use]
    pub fn succeeded(payload: serde_json::Value) -> Self {
        Self {
            state: JobState::Succeeded,
            result_payload: Some(payload),
            failure_reason: None,
        }
    }

    /// Provider-side failure.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result_payload: None,
            failure_reason: Some(reason.into()),
        }
    }

    /// Local timeout.
    #[must_use]
    pub fn timed_out(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::TimedOut,
            result_payload: None,
            failure_reason: Some(reason.into()),
        }
    }

    /// Attach a (partial) payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.result_payload = Some(payload);
        self
    }
}

/// Outcome of applying an [`Observation`] to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved forward to a non-terminal state.
    Advanced {
        /// Previous state.
        from: JobState,
        /// New state.
        to: JobState,
    },
    /// Reached a terminal state. Settlement must follow.
    Finalized {
        /// Previous state.
        from: JobState,
        /// Terminal state.
        to: JobState,
    },
    /// Observation repeats the current state.
    Unchanged,
    /// Observation would move the job backwards or out of a terminal
    /// state and was dropped.
    Ignored {
        /// State the job stays in.
        current: JobState,
        /// State that was observed.
        observed: JobState,
    },
}

impl Transition {
    /// Whether the job row changed.
    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Finalized { .. })
    }

    /// Whether this transition made the job terminal.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Finalized { .. })
    }

    /// Decide the transition from `current` given an `observed` state.
    #[must_use]
    pub fn plan(current: JobState, observed: JobState) -> Self {
        if current == observed {
            return Self::Unchanged;
        }
        if current.is_terminal() || observed.rank() < current.rank() {
            return Self::Ignored { current, observed };
        }
        if observed.is_terminal() {
            Self::Finalized {
                from: current,
                to: observed,
            }
        } else {
            Self::Advanced {
                from: current,
                to: observed,
            }
        }
    }
}

/// One outstanding request to an external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Internal job ID, minted before credits are reserved.
    pub id: JobId,

    /// Owner.
    pub user_id: UserId,

    /// Catalog service code.
    pub service_code: String,

    /// Provider fulfilling the job.
    pub provider: ProviderKind,

    /// Provider task ID. `None` until dispatch succeeds.
    pub provider_job_id: Option<ProviderJobId>,

    /// Units deducted at submission.
    pub cost_reserved: i64,

    /// Lifecycle state.
    pub state: JobState,

    /// Generation parameters as submitted.
    pub params: serde_json::Value,

    /// Result artifacts.
    pub result_payload: Option<serde_json::Value>,

    /// Why the job failed or timed out.
    pub failure_reason: Option<String>,

    /// Number of status polls made.
    pub poll_attempts: u32,

    /// When the job was submitted.
    pub created_at: DateTime<Utc>,

    /// When the job row last changed.
    pub updated_at: DateTime<Utc>,

    /// When the provider was last polled.
    pub last_polled_at: Option<DateTime<Utc>>,

    /// When terminal bookkeeping completed.
    pub settled_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// A new job in `SUBMITTED`.
    #[must_use]
    pub fn new(
        id: JobId,
        user_id: UserId,
        service_code: impl Into<String>,
        provider: ProviderKind,
        cost_reserved: i64,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            service_code: service_code.into(),
            provider,
            provider_job_id: None,
            cost_reserved,
            state: JobState::Submitted,
            params,
            result_payload: None,
            failure_reason: None,
            poll_attempts: 0,
            created_at: now,
            updated_at: now,
            last_polled_at: None,
            settled_at: None,
        }
    }

    /// Whether the job is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether terminal bookkeeping is done.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }

    /// Apply an observation in place, honouring monotonicity.
    ///
    /// Payload and failure reason are written only when the transition
    /// changes the row, so the first terminal writer wins.
    pub fn apply(&mut self, observation: &Observation) -> Transition {
        let transition = Transition::plan(self.state, observation.state);
        if transition.changed() {
            self.state = observation.state;
            if observation.result_payload.is_some() {
                self.result_payload.clone_from(&observation.result_payload);
            }
            if observation.failure_reason.is_some() {
                self.failure_reason.clone_from(&observation.failure_reason);
            }
            self.updated_at = Utc::now();
        }
        transition
    }
}
