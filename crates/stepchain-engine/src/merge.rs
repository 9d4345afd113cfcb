//! Folding a finished unit back into chain state: postprocessing, result
//! recording, and error escalation.

use serde_json::Value;
use stepchain_template::{apply_effects, Scope};
use stepchain_types::{path, ChainError, ChainExit, Context, Result, Results, UnitOutcome};

use crate::spec::{ContextSource, ErrorOverride, PostprocessAction};

/// What the executor should do after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Continue,
    /// The unit failed under an `error` override; the chain stops here.
    Exit(ChainExit),
}

/// Per-step merge instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePlan<'a> {
    pub postprocess: &'a [PostprocessAction],
    pub error: Option<&'a ErrorOverride>,
}

/// Merge `outcome` into `ctx` and `results` under `ordinal`.
///
/// A failure with an override ends the chain without recording anything. A
/// failure without one is logged and its outputs recorded; postprocessing
/// only runs for successful units.
pub fn merge(
    outcome: &UnitOutcome,
    plan: MergePlan<'_>,
    ordinal: usize,
    ctx: &mut Context,
    results: &mut Results,
) -> Result<MergeDecision> {
    if !outcome.success {
        if let Some(over) = plan.error {
            tracing::warn!(
                ordinal,
                unit_code = outcome.code,
                code = over.code,
                "Unit failed; escalating to chain exit"
            );
            return Ok(MergeDecision::Exit(ChainExit {
                code: over.code,
                message: over.message.clone().or_else(|| outcome.message.clone()),
            }));
        }
        tracing::warn!(
            ordinal,
            code = outcome.code,
            message = outcome.message.as_deref().unwrap_or(""),
            "Unit failed; continuing"
        );
    } else {
        for (i, action) in plan.postprocess.iter().enumerate() {
            run_action(action, outcome, ctx, results)
                .map_err(|e| annotate(e, ordinal, i))?;
        }
    }

    results.record_outputs(ordinal, outcome.outputs.clone())?;
    Ok(MergeDecision::Continue)
}

fn run_action(
    action: &PostprocessAction,
    outcome: &UnitOutcome,
    ctx: &mut Context,
    results: &mut Results,
) -> Result<()> {
    match action {
        PostprocessAction::Expression(expr) => {
            let mut effects = Vec::new();
            let scope = Scope::new(ctx, results).with_outputs(&outcome.outputs);
            expr.evaluate_with_effects(&scope, &mut effects)?;
            apply_effects(effects, ctx, results)
        }
        PostprocessAction::ToContext { name, source } => {
            let value = match source {
                ContextSource::Value(v) => v.clone(),
                ContextSource::Output(output) => path::get(&outcome.outputs, output)
                    .cloned()
                    .ok_or_else(|| ChainError::Resolution {
                        input: name.clone(),
                        message: format!("unit has no output '{output}'"),
                    })?,
            };
            tracing::debug!(name = %name, "to_context");
            ctx.set(name, value)
        }
    }
}

fn annotate(err: ChainError, ordinal: usize, action: usize) -> ChainError {
    match err {
        ChainError::Evaluation { expression, message } => ChainError::Evaluation {
            expression,
            message: format!("{message} (postprocess {action} of unit {ordinal})"),
        },
        other => other,
    }
}

/// Keys of `ctx` whose value differs from `before`.
pub fn changed_keys(before: &serde_json::Map<String, Value>, ctx: &Context) -> Vec<String> {
    ctx.as_map()
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}
