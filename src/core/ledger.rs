//! Run-scoped record of each step's outcome.
//!
//! The ledger drives both step gating and the process exit status. Every slot
//! starts as [`Outcome::NotAttempted`] and is written at most once, by the
//! step that owns it.

use serde::Serialize;
use std::fmt;

/// Step identities, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    GitSync,
    Provision,
    RemoteTests,
    CollectResults,
    Notify,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::GitSync,
        Step::Provision,
        Step::RemoteTests,
        Step::CollectResults,
        Step::Notify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::GitSync => "gitsync",
            Step::Provision => "provision",
            Step::RemoteTests => "remote-tests",
            Step::CollectResults => "collect-results",
            Step::Notify => "notify",
        }
    }

    /// Ledger slot name written by this step.
    pub fn slot(&self) -> &'static str {
        match self {
            Step::GitSync => "git",
            Step::Provision => "provisioning",
            Step::RemoteTests => "remote-tests",
            Step::CollectResults => "artifact-collection",
            Step::Notify => "notification",
        }
    }

    fn index(&self) -> usize {
        match self {
            Step::GitSync => 0,
            Step::Provision => 1,
            Step::RemoteTests => 2,
            Step::CollectResults => 3,
            Step::Notify => 4,
        }
    }

    /// The step whose success gates this one, if any.
    pub fn upstream(&self) -> Option<Step> {
        match self {
            Step::GitSync => None,
            Step::Provision => Some(Step::GitSync),
            Step::RemoteTests => Some(Step::Provision),
            Step::CollectResults => Some(Step::RemoteTests),
            Step::Notify => None,
        }
    }

    /// Whether the step talks to the controller host.
    pub fn needs_controller(&self) -> bool {
        matches!(self, Step::RemoteTests | Step::CollectResults)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    NotAttempted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct ResultLedger {
    slots: [Outcome; 5],
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step: Step) -> Outcome {
        self.slots[step.index()]
    }

    /// Record a step's outcome. A slot that already holds a result keeps it.
    pub fn record(&mut self, step: Step, outcome: Outcome) {
        let slot = &mut self.slots[step.index()];
        if *slot != Outcome::NotAttempted {
            tracing::warn!(step = %step, "ledger slot already recorded, keeping first outcome");
            return;
        }
        *slot = outcome;
    }

    pub fn entries(&self) -> impl Iterator<Item = (Step, Outcome)> + '_ {
        Step::ALL.iter().map(move |step| (*step, self.get(*step)))
    }

    pub fn has_failure(&self) -> bool {
        self.slots.iter().any(|o| matches!(o, Outcome::Failed))
    }

    /// 0 when every slot is succeeded or never attempted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.has_failure() {
            1
        } else {
            0
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            slots: self
                .entries()
                .map(|(step, outcome)| SlotEntry {
                    slot: step.slot(),
                    outcome,
                })
                .collect(),
            exit_code: self.exit_code(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub slot: &'static str,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub slots: Vec<SlotEntry>,
    pub exit_code: i32,
}
