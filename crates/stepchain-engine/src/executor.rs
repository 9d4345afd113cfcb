//! Chain executor: drives the step machine, resolves and dispatches units,
//! and merges their outcomes.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use stepchain_template::{apply_effects, Scope};
use stepchain_types::{ChainError, ChainExit, ChainOutput, Context, Result, Results};

use crate::backend::ExecutionBackend;
use crate::config::ChainConfig;
use crate::events::{ChainEvent, EventEmitter};
use crate::gate::{self, CancelHandle, Dispatch};
use crate::machine::{StepMachine, Transition};
use crate::merge::{self, MergeDecision, MergePlan};
use crate::resolver::{resolve_inputs, ResolveScope};
use crate::spec::{ChainSpec, Step, StepKind};
use crate::types::TypeRegistry;
use crate::validation::validate_or_raise;

/// Mutable state of one run.
#[derive(Debug, Default)]
struct RunState {
    ctx: Context,
    results: Results,
    /// Outputs of the most recently finished unit.
    current: Option<Map<String, Value>>,
    next_ordinal: usize,
    units_submitted: usize,
}

pub struct ChainExecutor {
    backend: Arc<dyn ExecutionBackend>,
    types: TypeRegistry,
    config: ChainConfig,
    events: EventEmitter,
}

impl ChainExecutor {
    /// Create an executor with the built-in types and default limits.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        let config = ChainConfig::default();
        Self {
            backend,
            types: TypeRegistry::with_builtins(),
            events: EventEmitter::new(config.event_capacity),
            config,
        }
    }

    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.events = EventEmitter::new(config.event_capacity);
        self.config = config;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub async fn run(&self, spec: &ChainSpec) -> Result<ChainOutput> {
        self.run_with_cancel(spec, &CancelHandle::new()).await
    }

    /// Run `spec` to completion, a controlled exit, or the first fatal error.
    pub async fn run_with_cancel(&self, spec: &ChainSpec, cancel: &CancelHandle) -> Result<ChainOutput> {
        validate_or_raise(spec)?;

        let run_id = uuid::Uuid::new_v4();
        let started_at = chrono::Utc::now();
        let clock = Instant::now();
        tracing::info!(run_id = %run_id, steps = spec.step_count(), backend = self.backend.name(), "Chain started");
        self.events.emit(ChainEvent::ChainStarted {
            run_id: run_id.to_string(),
            step_count: spec.step_count(),
        });

        let mut state = RunState::default();
        let exit = match self.drive(spec, &mut state, cancel).await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Chain failed");
                self.events.emit(ChainEvent::ChainFailed {
                    run_id: run_id.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        match &exit {
            Some(exit) => {
                tracing::warn!(run_id = %run_id, code = exit.code, "Chain exited early");
                self.events.emit(ChainEvent::ChainAborted {
                    run_id: run_id.to_string(),
                    code: exit.code,
                    message: exit.message.clone(),
                });
            }
            None => {
                tracing::info!(run_id = %run_id, results = state.results.len(), duration_ms, "Chain completed");
                self.events.emit(ChainEvent::ChainCompleted {
                    run_id: run_id.to_string(),
                    results: state.results.len(),
                    duration_ms,
                });
            }
        }

        Ok(ChainOutput {
            run_id,
            results: state.results,
            context: state.ctx.into_map(),
            exit,
            units_submitted: state.units_submitted,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    async fn drive(
        &self,
        spec: &ChainSpec,
        state: &mut RunState,
        cancel: &CancelHandle,
    ) -> Result<Option<ChainExit>> {
        for expr in &spec.setup {
            let mut effects = Vec::new();
            expr.evaluate_with_effects(&Scope::new(&state.ctx, &state.results), &mut effects)?;
            apply_effects(effects, &mut state.ctx, &mut state.results)?;
        }
        if !spec.setup.is_empty() {
            tracing::debug!(expressions = spec.setup.len(), "Setup done");
            self.events.emit(ChainEvent::SetupCompleted {
                expressions: spec.setup.len(),
            });
        }

        let mut machine = StepMachine::new(spec.steps.clone(), self.config.max_transitions);
        loop {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }

            let transition = {
                let scope = Scope::new(&state.ctx, &state.results);
                machine.transition(|expr| expr.evaluate_bool(&scope))?
            };

            match transition {
                Transition::Dispatch(id) => {
                    let step = machine
                        .step(id)
                        .ok_or_else(|| ChainError::Other(format!("no step at index {id}")))?;
                    let exit = self
                        .execute_step(id, step, state, cancel)
                        .await
                        .map_err(|e| e.at_step(id))?;
                    if exit.is_some() {
                        return Ok(exit);
                    }
                    machine.complete();
                }
                Transition::Finished => return Ok(None),
                Transition::Skipped(id) => {
                    let label = machine.step(id).map(Step::describe).unwrap_or_default();
                    tracing::debug!(step = id, label = %label, "Guard false; skipping");
                    self.events.emit(ChainEvent::StepSkipped { step: id, label });
                }
                Transition::Entered { step, depth } => {
                    tracing::debug!(step, depth, "Entering loop");
                    self.events.emit(ChainEvent::LoopEntered { step, depth });
                }
                Transition::Rerolled(step) => {
                    tracing::debug!(step, "Repeating loop");
                    self.events.emit(ChainEvent::LoopRepeated { step });
                }
                Transition::Exited(step) => {
                    tracing::debug!(step, "Leaving loop");
                    self.events.emit(ChainEvent::LoopExited { step });
                }
                Transition::Bypassed(step) => {
                    tracing::debug!(step, "Loop guard false on entry");
                }
                Transition::Returned(_) => {}
            }
        }
    }

    /// Run one unit or reference step. `Some` means the chain must stop.
    async fn execute_step(
        &self,
        id: usize,
        step: &Step,
        state: &mut RunState,
        cancel: &CancelHandle,
    ) -> Result<Option<ChainExit>> {
        let ordinal = state.next_ordinal;
        let started = Instant::now();

        let (outcome, plan, label) = match &step.kind {
            StepKind::Reference { node, postprocess } => {
                let label = step.describe();
                tracing::info!(step = id, ordinal, node, "Loading finished unit");
                self.events.emit(ChainEvent::UnitDispatched {
                    step: id,
                    ordinal,
                    label: label.clone(),
                });
                let outcome = gate::dispatch(self.backend.as_ref(), Dispatch::Reference(*node), cancel).await?;
                let plan = MergePlan {
                    postprocess,
                    error: None,
                };
                (outcome, plan, label)
            }
            StepKind::Unit(unit) => {
                let handle = self.backend.resolve(unit.kind, &unit.identifier).await?;
                let inputs = resolve_inputs(
                    unit,
                    &handle,
                    &self.types,
                    ResolveScope::new(&state.ctx, &state.results).with_current(state.current.as_ref()),
                )?;
                let label = handle.label();
                tracing::info!(step = id, ordinal, unit = %label, inputs = inputs.len(), "Dispatching unit");
                self.events.emit(ChainEvent::UnitDispatched {
                    step: id,
                    ordinal,
                    label: label.clone(),
                });

                let outcome = gate::dispatch(
                    self.backend.as_ref(),
                    Dispatch::Unit {
                        handle: &handle,
                        inputs,
                    },
                    cancel,
                )
                .await?;
                state.units_submitted += 1;
                let plan = MergePlan {
                    postprocess: &unit.postprocess,
                    error: unit.error.as_ref(),
                };
                (outcome, plan, label)
            }
            StepKind::Loop { .. } => {
                return Err(ChainError::Other("a loop step cannot be dispatched".into()));
            }
        };
        state.next_ordinal += 1;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            step = id,
            ordinal,
            unit = %label,
            success = outcome.success,
            code = outcome.code,
            duration_ms,
            "Unit finished"
        );
        self.events.emit(ChainEvent::UnitCompleted {
            step: id,
            ordinal,
            success: outcome.success,
            code: outcome.code,
            duration_ms,
        });

        let before = state.ctx.snapshot();
        let decision = merge::merge(&outcome, plan, ordinal, &mut state.ctx, &mut state.results)?;
        let keys = merge::changed_keys(&before, &state.ctx);
        if !keys.is_empty() {
            self.events.emit(ChainEvent::ContextUpdated { ordinal, keys });
        }
        state.current = Some(outcome.outputs);

        match decision {
            MergeDecision::Continue => Ok(None),
            MergeDecision::Exit(exit) => Ok(Some(exit)),
        }
    }
}
