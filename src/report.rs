//! Structured run reports.
//!
//! Every unit and every step outcome is enumerated; nothing is silently
//! swallowed. Reports derive `PartialEq` so tests assert on them whole.

use std::fmt;

use crate::error::Error;
use crate::spec::Step;

/// Why a step did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The diff found the step's effect already present in the schema.
    AlreadySatisfied,
    /// The ledger already records the whole unit as applied.
    UnitAlreadyApplied,
}

/// What happened to one step.
#[derive(Debug, PartialEq)]
pub enum StepOutcome {
    Applied {
        /// Rows touched, for backfill steps.
        rows_affected: Option<usize>,
    },
    Skipped(SkipReason),
    /// The step executed but its unit's transaction was rolled back.
    RolledBack,
    Failed(Error),
    /// An earlier failure, timeout or cancellation stopped the unit first.
    NotAttempted,
}

/// One step's identity and outcome.
#[derive(Debug, PartialEq)]
pub struct ActionReport {
    pub step: String,
    pub outcome: StepOutcome,
}

impl ActionReport {
    pub(crate) fn applied(step: &Step, rows_affected: Option<usize>) -> Self {
        Self {
            step: step.describe(),
            outcome: StepOutcome::Applied { rows_affected },
        }
    }

    pub(crate) fn skipped(step: &Step, reason: SkipReason) -> Self {
        Self {
            step: step.describe(),
            outcome: StepOutcome::Skipped(reason),
        }
    }

    pub(crate) fn failed(step: &Step, error: Error) -> Self {
        Self {
            step: step.describe(),
            outcome: StepOutcome::Failed(error),
        }
    }

    pub(crate) fn not_attempted(step: &Step) -> Self {
        Self {
            step: step.describe(),
            outcome: StepOutcome::NotAttempted,
        }
    }
}

/// Final state of one unit after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Every pending step succeeded and the ledger was stamped.
    Applied,
    /// The ledger already recorded this unit; nothing ran.
    AlreadyApplied,
    /// The unit failed and left no effects behind.
    Failed,
    /// The unit failed after some steps had already committed.
    PartiallyApplied,
    /// The supplied steps no longer match what the ledger recorded as applied.
    Drifted,
    /// A previous run recorded this unit as failed; it needs operator resolution.
    FailedPreviously,
    /// The run stopped (failure or cancellation) before this unit started.
    NotRun,
}

/// One unit's outcome with its ordered step reports.
#[derive(Debug, PartialEq)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
    pub actions: Vec<ActionReport>,
    /// Unit-level failure cause when no single step carries it
    /// (drift, timeout, previously-failed refusal).
    pub error: Option<Error>,
}

impl UnitReport {
    pub(crate) fn without_actions(unit: &str, outcome: UnitOutcome, error: Option<Error>) -> Self {
        Self {
            unit: unit.to_string(),
            outcome,
            actions: Vec::new(),
            error,
        }
    }

    pub fn steps_applied(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.outcome, StepOutcome::Applied { .. }))
            .count()
    }

    pub fn steps_skipped(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.outcome, StepOutcome::Skipped(_)))
            .count()
    }
}

/// The ordered unit reports of one run.
#[derive(Debug, PartialEq)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
}

impl RunReport {
    /// True when every unit ended Applied or AlreadyApplied.
    pub fn succeeded(&self) -> bool {
        self.units
            .iter()
            .all(|u| matches!(u.outcome, UnitOutcome::Applied | UnitOutcome::AlreadyApplied))
    }

    /// 0 when the run succeeded, 1 otherwise. Suitable for process exit.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == name)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied {
                rows_affected: Some(rows),
            } => write!(f, "applied ({} row(s))", rows),
            Self::Applied { rows_affected: None } => write!(f, "applied"),
            Self::Skipped(SkipReason::AlreadySatisfied) => {
                write!(f, "skipped (already satisfied)")
            }
            Self::Skipped(SkipReason::UnitAlreadyApplied) => {
                write!(f, "skipped (unit already applied)")
            }
            Self::RolledBack => write!(f, "rolled back"),
            Self::Failed(error) => write!(f, "failed: {}", error),
            Self::NotAttempted => write!(f, "not attempted"),
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already applied",
            Self::Failed => "failed",
            Self::PartiallyApplied => "partially applied",
            Self::Drifted => "drifted",
            Self::FailedPreviously => "failed previously, needs resolution",
            Self::NotRun => "not run",
        };
        f.write_str(label)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for unit in &self.units {
            writeln!(f, "unit {}: {}", unit.unit, unit.outcome)?;
            if let Some(error) = &unit.error {
                writeln!(f, "    cause: {}", error)?;
            }
            for action in &unit.actions {
                writeln!(f, "    {}: {}", action.step, action.outcome)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied_unit(name: &str) -> UnitReport {
        UnitReport {
            unit: name.to_string(),
            outcome: UnitOutcome::Applied,
            actions: vec![ActionReport {
                step: "create table users".to_string(),
                outcome: StepOutcome::Applied {
                    rows_affected: None,
                },
            }],
            error: None,
        }
    }

    #[test]
    fn exit_code_zero_when_all_applied_or_skipped() {
        let report = RunReport {
            units: vec![
                applied_unit("one"),
                UnitReport::without_actions("two", UnitOutcome::AlreadyApplied, None),
            ],
        };
        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn exit_code_nonzero_on_any_failure() {
        let report = RunReport {
            units: vec![
                applied_unit("one"),
                UnitReport::without_actions("two", UnitOutcome::PartiallyApplied, None),
            ],
        };
        assert!(!report.succeeded());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn rendering_enumerates_units_and_steps() {
        let report = RunReport {
            units: vec![applied_unit("create_users")],
        };
        let rendered = report.to_string();
        assert!(rendered.contains("unit create_users: applied"));
        assert!(rendered.contains("create table users: applied"));
    }
}
