//! Step-list state machine.
//!
//! Loops are run by splicing: entering a `while` appends a copy of its body to
//! the end of the working step list and pushes a [`LoopFrame`] remembering
//! where the loop step sits and where its body starts. Leaving the loop
//! truncates the list back to the body start. Frames nest, so inner loops
//! splice their bodies after the outer body.
//!
//! [`StepMachine::transition`] performs exactly one transition and reports it;
//! [`StepMachine::advance`] keeps transitioning until a step is dispatched or
//! the chain is finished. Neither recurses.

use stepchain_template::Expression;
use stepchain_types::{ChainError, Result};

use crate::spec::{Step, StepKind};

/// Saved indices bracketing a spliced-in loop body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFrame {
    /// Index of the `while` step itself.
    pub entry_id: usize,
    /// Index of the first spliced body step.
    pub first_id: usize,
}

/// What a single call to [`StepMachine::transition`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// An `if` guard was false; the step was passed over.
    Skipped(usize),
    /// A loop was entered and its body spliced in.
    Entered { step: usize, depth: usize },
    /// The loop guard still holds; the body runs again.
    Rerolled(usize),
    /// The loop guard turned false; the body was removed.
    Exited(usize),
    /// A loop guard was false on first evaluation.
    Bypassed(usize),
    /// The end of a loop body was reached; control returns to the loop step.
    Returned(usize),
    /// A unit or reference step is ready to run.
    Dispatch(usize),
    Finished,
}

#[derive(Debug, Clone)]
pub struct StepMachine {
    steps: Vec<Step>,
    current_id: usize,
    frames: Vec<LoopFrame>,
    transitions: usize,
    max_transitions: Option<usize>,
}

impl StepMachine {
    pub fn new(steps: Vec<Step>, max_transitions: Option<usize>) -> Self {
        Self {
            steps,
            current_id: 0,
            frames: Vec::new(),
            transitions: 0,
            max_transitions,
        }
    }

    pub fn current_id(&self) -> usize {
        self.current_id
    }

    /// Length of the working list, including spliced bodies.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn frames(&self) -> &[LoopFrame] {
        &self.frames
    }

    pub fn transitions(&self) -> usize {
        self.transitions
    }

    pub fn step(&self, id: usize) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn is_finished(&self) -> bool {
        self.current_id >= self.steps.len() && self.frames.is_empty()
    }

    /// Move past a dispatched step once its outcome has been merged.
    pub fn complete(&mut self) {
        self.current_id += 1;
    }

    fn tick(&mut self) -> Result<()> {
        self.transitions += 1;
        match self.max_transitions {
            Some(limit) if self.transitions > limit => Err(ChainError::TransitionLimit { limit }),
            _ => Ok(()),
        }
    }

    /// Perform one transition. `guard` evaluates `if`/`while` expressions.
    pub fn transition<F>(&mut self, mut guard: F) -> Result<Transition>
    where
        F: FnMut(&Expression) -> Result<bool>,
    {
        if self.current_id >= self.steps.len() {
            return match self.frames.last().copied() {
                Some(frame) => {
                    self.tick()?;
                    self.current_id = frame.entry_id;
                    Ok(Transition::Returned(frame.entry_id))
                }
                None => Ok(Transition::Finished),
            };
        }
        self.tick()?;

        let id = self.current_id;
        let inside = self.frames.last().is_some_and(|f| f.entry_id == id);
        let step = &self.steps[id];

        // A loop's `if` only gates entry; once inside, `while` alone decides.
        if !inside {
            if let Some(condition) = &step.condition {
                if !guard(condition).map_err(|e| e.at_step(id))? {
                    self.current_id += 1;
                    return Ok(Transition::Skipped(id));
                }
            }
        }

        let StepKind::Loop { condition, steps } = &step.kind else {
            return Ok(Transition::Dispatch(id));
        };
        let holds = guard(condition).map_err(|e| e.at_step(id))?;

        match (holds, inside) {
            (true, false) => {
                let body = steps.clone();
                let first_id = self.steps.len();
                self.frames.push(LoopFrame {
                    entry_id: id,
                    first_id,
                });
                self.steps.extend(body);
                self.current_id = first_id;
                Ok(Transition::Entered {
                    step: id,
                    depth: self.frames.len(),
                })
            }
            (true, true) => {
                if let Some(frame) = self.frames.last() {
                    self.current_id = frame.first_id;
                }
                Ok(Transition::Rerolled(id))
            }
            (false, true) => {
                if let Some(frame) = self.frames.pop() {
                    self.steps.truncate(frame.first_id);
                    self.current_id = frame.entry_id + 1;
                }
                Ok(Transition::Exited(id))
            }
            (false, false) => {
                self.current_id += 1;
                Ok(Transition::Bypassed(id))
            }
        }
    }

    /// Transition until a step is dispatched (`Some(id)`) or the chain is
    /// finished (`None`).
    pub fn advance<F>(&mut self, mut guard: F) -> Result<Option<usize>>
    where
        F: FnMut(&Expression) -> Result<bool>,
    {
        loop {
            match self.transition(&mut guard)? {
                Transition::Dispatch(id) => return Ok(Some(id)),
                Transition::Finished => return Ok(None),
                _ => {}
            }
        }
    }
}
