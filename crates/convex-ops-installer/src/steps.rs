use tracing::{info, warn};

use crate::error::{LifecycleError, LifecycleResult, StepContext};

type Action<'a> = Box<dyn FnOnce() -> LifecycleResult<()> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompensationMode {
    Required,
    BestEffort,
}

struct Compensation<'a> {
    name: &'static str,
    mode: CompensationMode,
    action: Action<'a>,
}

/// One forward action of a lifecycle operation, with an optional undo.
///
/// The undo is armed before the forward action runs, so it must cope with a
/// forward action that only partially happened.
pub struct Step<'a> {
    name: &'static str,
    forward: Action<'a>,
    compensation: Option<Compensation<'a>>,
}

impl<'a> Step<'a> {
    pub fn new(name: &'static str, forward: impl FnOnce() -> LifecycleResult<()> + 'a) -> Self {
        Self {
            name,
            forward: Box::new(forward),
            compensation: None,
        }
    }

    /// A step whose action reports plumbing errors; they are wrapped with the
    /// step name.
    pub fn wrapped(name: &'static str, action: impl FnOnce() -> anyhow::Result<()> + 'a) -> Self {
        Self::new(name, move || action().step(name))
    }

    pub fn compensate(
        mut self,
        name: &'static str,
        action: impl FnOnce() -> LifecycleResult<()> + 'a,
    ) -> Self {
        self.compensation = Some(Compensation {
            name,
            mode: CompensationMode::Required,
            action: Box::new(action),
        });
        self
    }

    pub fn compensate_best_effort(
        mut self,
        name: &'static str,
        action: impl FnOnce() -> LifecycleResult<()> + 'a,
    ) -> Self {
        self.compensation = Some(Compensation {
            name,
            mode: CompensationMode::BestEffort,
            action: Box::new(action),
        });
        self
    }
}

#[derive(Debug)]
pub enum StepFailure {
    /// A forward action failed and every required compensation succeeded.
    Compensated {
        step: &'static str,
        cause: LifecycleError,
        compensations_run: usize,
    },
    /// A required compensation failed; the host is in an unknown state.
    CompensationFailed {
        step: &'static str,
        cause: LifecycleError,
        compensation: &'static str,
        compensation_cause: LifecycleError,
    },
}

impl StepFailure {
    /// Collapses the failure when the caller has nothing to report beyond the
    /// original cause.
    pub fn into_cause(self) -> LifecycleError {
        match self {
            Self::Compensated { cause, .. } => cause,
            Self::CompensationFailed {
                step,
                cause,
                compensation,
                compensation_cause,
            } => LifecycleError::DoubleFailure {
                step: step.to_string(),
                cause: Box::new(cause),
                rollback_step: compensation.to_string(),
                rollback_cause: Box::new(compensation_cause),
            },
        }
    }
}

/// Runs steps in order. On the first failure, compensations of every attempted
/// step run newest first.
pub fn run_steps(steps: Vec<Step<'_>>) -> Result<(), StepFailure> {
    let mut armed: Vec<Compensation<'_>> = Vec::new();

    for step in steps {
        info!("step: {}", step.name);
        if let Some(compensation) = step.compensation {
            armed.push(compensation);
        }

        let Err(cause) = (step.forward)() else {
            continue;
        };

        warn!(step = step.name, error = %cause, "step failed");
        let mut compensations_run = 0;
        while let Some(compensation) = armed.pop() {
            info!("compensate: {}", compensation.name);
            compensations_run += 1;
            match ((compensation.action)(), compensation.mode) {
                (Ok(()), _) => {}
                (Err(err), CompensationMode::BestEffort) => {
                    warn!(
                        compensation = compensation.name,
                        error = %err,
                        "best-effort compensation failed"
                    );
                }
                (Err(err), CompensationMode::Required) => {
                    return Err(StepFailure::CompensationFailed {
                        step: step.name,
                        cause,
                        compensation: compensation.name,
                        compensation_cause: err,
                    });
                }
            }
        }

        return Err(StepFailure::Compensated {
            step: step.name,
            cause,
            compensations_run,
        });
    }

    Ok(())
}
