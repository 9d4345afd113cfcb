//! Step-list interpreter for declarative chains.
//!
//! This crate loads a chain document (resolving `$ref` includes), validates
//! it, and runs it: `if`/`while` guards drive a splicing step machine, unit
//! inputs are resolved and coerced through the type registry, the submission
//! gate hands each unit to an [`ExecutionBackend`], and outcomes are merged
//! back into the context and results.

pub mod backend;
pub mod backends;
pub mod config;
pub mod events;
pub mod executor;
pub mod gate;
pub mod loader;
pub mod machine;
pub mod merge;
pub mod resolver;
pub mod spec;
pub mod types;
pub mod validation;

pub use backend::{ExecutionBackend, PortSpec, SubmitMode, UnitHandle};
pub use backends::{NodeStore, ProcessBackend};
pub use config::{ChainConfig, ProcessBackendConfig, StepchainConfig, UnitConfig};
pub use events::{ChainEvent, EventEmitter};
pub use executor::ChainExecutor;
pub use gate::{dispatch, CancelHandle, Dispatch};
pub use loader::{load_chain, DocumentLoader, Format, MAX_REF_DEPTH};
pub use machine::{LoopFrame, StepMachine, Transition};
pub use merge::{merge, MergeDecision, MergePlan};
pub use resolver::{resolve_inputs, ResolveScope};
pub use spec::{
    ChainSpec, ContextSource, ErrorOverride, InputDescriptor, InputSource, LinkTarget,
    PostprocessAction, Step, StepKind, UnitKind, UnitStep,
};
pub use types::{CoercionError, TypeRegistry, TypeResolver};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
