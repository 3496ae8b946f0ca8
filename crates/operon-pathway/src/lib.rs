//! Pathway executor: composes contract slots into multi-step operations.
//! Resolution is fusion-aware (the fused allele runs first when present),
//! step inputs bind through a tiny reference DSL, and failures follow the
//! pathway's declared policy. Actual locus invocation happens behind the
//! [`StepInvoker`] seam so the executor stays independent of the loader,
//! arena, and mutation plumbing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use operon_contract::{ContractSet, GeneFamily, PathwayContract, PathwayStep, StepTarget};
use operon_fusion::{FusionError, FusionSignal, FusionTracker};
use operon_phenotype::{PhenotypeError, PhenotypeMap};
use operon_safety::{RollbackReport, Transaction};
use operon_sandbox::Capability;

pub type Digest = String;

const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(30);

/// A transaction left open by a successful configuration step, so the
/// pathway can commit it at the end or drain it on rollback-all.
#[derive(Clone)]
pub struct PendingTransaction {
    pub transaction: Arc<Mutex<Transaction>>,
    /// Raw (unwrapped) capability the inverses replay against.
    pub capability: Arc<dyn Capability>,
}

impl PendingTransaction {
    pub fn commit(&self) {
        if let Ok(mut transaction) = self.transaction.lock() {
            transaction.commit();
        }
    }

    pub fn rollback(&self) -> RollbackReport {
        match self.transaction.lock() {
            Ok(mut transaction) => transaction.rollback(self.capability.as_ref()),
            Err(_) => RollbackReport::default(),
        }
    }
}

/// Result of one locus invocation through its allele stack.
pub struct StepExecution {
    pub output: Value,
    pub digest: Digest,
    pub transaction: Option<PendingTransaction>,
}

#[derive(Clone, Debug, Error)]
pub enum StepFault {
    #[error("locus '{locus}' exhausted: {last_error}")]
    Exhausted { locus: String, last_error: String },
    #[error("{0}")]
    Failed(String),
}

/// The runtime's side of step execution: run a locus through
/// `[dominant, fallback...]`, score each attempt, and hand back the output
/// with any still-open transaction.
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke_locus(&self, locus: &str, input: &str) -> Result<StepExecution, StepFault>;

    /// Invoke a pathway's fused allele as a single gene.
    async fn invoke_fused(
        &self,
        pathway: &str,
        digest: &str,
        input: &str,
    ) -> Result<Value, StepFault>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum StepStatus {
    Succeeded,
    Failed { error: String },
    Skipped,
}

#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
}

/// A diagnostic the contract asks to run after success, already bound to its
/// resolved input. The core emits these; the surrounding runtime owns the
/// timer that fires them.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifyRequest {
    pub locus: String,
    pub input: String,
    pub delay: Duration,
    /// The configuration locus and digest whose convergence this verifies.
    pub subject_locus: String,
    pub subject_digest: Digest,
}

#[derive(Clone, Debug)]
pub struct PathwayResult {
    pub pathway: String,
    pub success: bool,
    pub used_fused: bool,
    pub steps: Vec<StepOutcome>,
    pub composition: Vec<Digest>,
    pub fusion_signal: Option<FusionSignal>,
    pub verify: Vec<VerifyRequest>,
}

#[derive(Debug, Error)]
pub enum PathwayError {
    #[error("unknown pathway: {0}")]
    UnknownPathway(String),
    #[error("pathway input must be a JSON object: {0}")]
    InvalidInput(String),
    #[error("binding error: {0}")]
    Binding(String),
    #[error("dependency cycle involving step {0}")]
    DependencyCycle(usize),
    #[error("pathway run cancelled at step {0}")]
    Cancelled(usize),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Phenotype(#[from] PhenotypeError),
}

pub struct PathwayExecutor {
    contracts: Arc<ContractSet>,
    phenotype: Arc<PhenotypeMap>,
    tracker: Arc<FusionTracker>,
}

impl PathwayExecutor {
    pub fn new(
        contracts: Arc<ContractSet>,
        phenotype: Arc<PhenotypeMap>,
        tracker: Arc<FusionTracker>,
    ) -> Self {
        Self {
            contracts,
            phenotype,
            tracker,
        }
    }

    pub async fn run(
        &self,
        invoker: &dyn StepInvoker,
        pathway_name: &str,
        input: &str,
    ) -> Result<PathwayResult, PathwayError> {
        let never = AtomicBool::new(false);
        self.run_cancellable(invoker, pathway_name, input, &never)
            .await
    }

    /// Run with a cancellation token checked at step boundaries. Cancelling
    /// mid-pathway drains every open transaction.
    pub async fn run_cancellable(
        &self,
        invoker: &dyn StepInvoker,
        pathway_name: &str,
        input: &str,
        cancel: &AtomicBool,
    ) -> Result<PathwayResult, PathwayError> {
        let contract = self
            .contracts
            .pathway(pathway_name)
            .cloned()
            .ok_or_else(|| PathwayError::UnknownPathway(pathway_name.to_string()))?;
        let input_value: Value = serde_json::from_str(input)
            .map_err(|err| PathwayError::InvalidInput(err.to_string()))?;
        if !input_value.is_object() {
            return Err(PathwayError::InvalidInput(
                "top-level value is not an object".into(),
            ));
        }

        // Fused-first resolution.
        if let Some(fused) = self.phenotype.pathway_state(pathway_name)?.fused_allele {
            debug!(pathway = pathway_name, digest = %fused, "attempting fused execution");
            match invoker.invoke_fused(pathway_name, &fused, input).await {
                Ok(output) => {
                    let signal = self.tracker.observe_fused(pathway_name, true)?;
                    return Ok(PathwayResult {
                        pathway: pathway_name.to_string(),
                        success: true,
                        used_fused: true,
                        steps: vec![StepOutcome {
                            index: 0,
                            name: format!("{pathway_name} (fused)"),
                            status: StepStatus::Succeeded,
                            output: Some(output),
                        }],
                        composition: vec![fused],
                        fusion_signal: signal,
                        verify: Vec::new(),
                    });
                }
                Err(fault) => {
                    warn!(pathway = pathway_name, error = %fault, "fused execution failed");
                    self.tracker.observe_fused(pathway_name, false)?;
                    // Fall through to the decomposed step form.
                }
            }
        }

        self.run_decomposed(invoker, &contract, &input_value, cancel)
            .await
    }

    async fn run_decomposed(
        &self,
        invoker: &dyn StepInvoker,
        contract: &PathwayContract,
        input: &Value,
        cancel: &AtomicBool,
    ) -> Result<PathwayResult, PathwayError> {
        let order = execution_order(&contract.steps)?;
        let steps_by_index: BTreeMap<usize, &PathwayStep> = contract
            .steps
            .iter()
            .map(|step| (step.index, step))
            .collect();

        let mut outputs: BTreeMap<usize, Value> = BTreeMap::new();
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        let mut composition: Vec<Digest> = Vec::new();
        let mut open_transactions: Vec<PendingTransaction> = Vec::new();
        let mut verify: Vec<VerifyRequest> = Vec::new();
        let mut dead: BTreeSet<usize> = BTreeSet::new();
        let mut failed = false;

        for &index in &order {
            let step = steps_by_index[&index];
            if cancel.load(Ordering::Relaxed) {
                rollback_all(&mut open_transactions);
                self.tracker
                    .observe(&contract.name, &composition, false)?;
                return Err(PathwayError::Cancelled(index));
            }
            if dead.contains(&index) {
                outcomes.push(StepOutcome {
                    index,
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    output: None,
                });
                continue;
            }

            // Guard: `when step N.field = literal`.
            if let Some(guard) = &step.guard {
                let observed = lookup_step_field(&outputs, guard.step, Some(&guard.field))
                    .map_err(PathwayError::Binding)?;
                if observed != guard.equals {
                    debug!(pathway = %contract.name, step = index, "guard false, skipping");
                    outcomes.push(StepOutcome {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        output: None,
                    });
                    continue;
                }
            }

            let result = self
                .run_step(invoker, contract, step, input, &outputs, cancel)
                .await?;
            match result {
                StepRun::Done {
                    output,
                    digests,
                    transactions,
                    step_verify,
                } => {
                    outputs.insert(index, output.clone());
                    composition.extend(digests);
                    open_transactions.extend(transactions);
                    verify.extend(step_verify);
                    outcomes.push(StepOutcome {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Succeeded,
                        output: Some(output),
                    });
                }
                StepRun::Faulted(fault) => {
                    warn!(pathway = %contract.name, step = index, error = %fault, "step failed");
                    outcomes.push(StepOutcome {
                        index,
                        name: step.name.clone(),
                        status: StepStatus::Failed {
                            error: fault.to_string(),
                        },
                        output: None,
                    });
                    failed = true;
                    match contract.on_failure {
                        operon_contract::FailurePolicy::RollbackAll => {
                            rollback_all(&mut open_transactions);
                            break;
                        }
                        operon_contract::FailurePolicy::ReportPartial => {
                            mark_dependents_dead(&contract.steps, index, &mut dead);
                        }
                    }
                }
            }
        }

        let success = !failed;
        if success {
            for transaction in &open_transactions {
                transaction.commit();
            }
        } else if contract.on_failure == operon_contract::FailurePolicy::ReportPartial {
            // Partial results stand; succeeded steps keep their effects.
            for transaction in &open_transactions {
                transaction.commit();
            }
        }

        let fusion_signal = self
            .tracker
            .observe(&contract.name, &composition, success)?;
        if success {
            info!(pathway = %contract.name, steps = outcomes.len(), "pathway completed");
        }
        Ok(PathwayResult {
            pathway: contract.name.clone(),
            success,
            used_fused: false,
            steps: outcomes,
            composition,
            fusion_signal,
            verify: if success { verify } else { Vec::new() },
        })
    }

    async fn run_step(
        &self,
        invoker: &dyn StepInvoker,
        contract: &PathwayContract,
        step: &PathwayStep,
        input: &Value,
        outputs: &BTreeMap<usize, Value>,
        cancel: &AtomicBool,
    ) -> Result<StepRun, PathwayError> {
        match &step.target {
            StepTarget::SubPathway(name) => {
                let bound = bind_step_input(step, input, outputs, None)
                    .map_err(PathwayError::Binding)?;
                let nested = Box::pin(self.run_cancellable(
                    invoker,
                    name,
                    &bound,
                    cancel,
                ))
                .await?;
                if nested.success {
                    let output = Value::Array(
                        nested
                            .steps
                            .iter()
                            .filter_map(|outcome| outcome.output.clone())
                            .collect(),
                    );
                    Ok(StepRun::Done {
                        output,
                        digests: nested.composition,
                        transactions: Vec::new(),
                        step_verify: nested.verify,
                    })
                } else {
                    Ok(StepRun::Faulted(StepFault::Failed(format!(
                        "sub-pathway '{name}' failed"
                    ))))
                }
            }
            StepTarget::Locus(locus) => {
                if let Some(iterate) = &step.iterate {
                    let sequence = resolve_reference(&iterate.expr, input, outputs, None)
                        .map_err(PathwayError::Binding)?;
                    let Value::Array(items) = sequence else {
                        return Err(PathwayError::Binding(format!(
                            "iteration expression '{}' is not a sequence",
                            iterate.expr
                        )));
                    };
                    let mut collected = Vec::with_capacity(items.len());
                    let mut digests = Vec::new();
                    let mut transactions = Vec::new();
                    let mut step_verify = Vec::new();
                    for item in items {
                        let bound = bind_step_input(
                            step,
                            input,
                            outputs,
                            Some((&iterate.variable, &item)),
                        )
                        .map_err(PathwayError::Binding)?;
                        match invoker.invoke_locus(locus, &bound).await {
                            Ok(execution) => {
                                step_verify.extend(self.verify_requests(
                                    locus,
                                    &execution.digest,
                                    &bound,
                                ));
                                collected.push(execution.output);
                                if !digests.contains(&execution.digest) {
                                    digests.push(execution.digest);
                                }
                                transactions.extend(execution.transaction);
                            }
                            Err(fault) => {
                                // Abandon the batch; prior elements' effects
                                // are governed by the pathway policy.
                                for transaction in &transactions {
                                    transaction.rollback();
                                }
                                return Ok(StepRun::Faulted(fault));
                            }
                        }
                    }
                    Ok(StepRun::Done {
                        output: Value::Array(collected),
                        digests,
                        transactions,
                        step_verify,
                    })
                } else {
                    let bound = bind_step_input(step, input, outputs, None)
                        .map_err(PathwayError::Binding)?;
                    match invoker.invoke_locus(locus, &bound).await {
                        Ok(execution) => {
                            let step_verify =
                                self.verify_requests(locus, &execution.digest, &bound);
                            Ok(StepRun::Done {
                                output: execution.output,
                                digests: vec![execution.digest],
                                transactions: execution.transaction.into_iter().collect(),
                                step_verify,
                            })
                        }
                        Err(fault) => Ok(StepRun::Faulted(fault)),
                    }
                }
            }
        }
    }

    fn verify_requests(&self, locus: &str, digest: &str, input: &str) -> Vec<VerifyRequest> {
        let Some(contract) = self.contracts.gene(locus) else {
            return Vec::new();
        };
        if contract.verify.is_empty() || contract.family != GeneFamily::Configuration {
            return Vec::new();
        }
        let delay = contract
            .convergence_window()
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_VERIFY_DELAY);
        contract
            .verify
            .iter()
            .filter_map(|step| {
                match resolve_verify_params(&step.params, input) {
                    Ok(resolved) => Some(VerifyRequest {
                        locus: step.locus.clone(),
                        input: resolved,
                        delay,
                        subject_locus: locus.to_string(),
                        subject_digest: digest.to_string(),
                    }),
                    Err(err) => {
                        warn!(locus, error = %err, "verify step binding failed");
                        None
                    }
                }
            })
            .collect()
    }
}

enum StepRun {
    Done {
        output: Value,
        digests: Vec<Digest>,
        transactions: Vec<PendingTransaction>,
        step_verify: Vec<VerifyRequest>,
    },
    Faulted(StepFault),
}

fn rollback_all(open: &mut Vec<PendingTransaction>) {
    while let Some(transaction) = open.pop() {
        let report = transaction.rollback();
        if !report.is_clean() {
            warn!(failures = report.failures.len(), "pathway rollback incomplete");
        }
    }
}

/// Topological order over explicit `needs` plus implicit `{step N...}`
/// references, stable by step index within a layer.
fn execution_order(steps: &[PathwayStep]) -> Result<Vec<usize>, PathwayError> {
    let mut needs: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    let known: BTreeSet<usize> = steps.iter().map(|step| step.index).collect();
    for step in steps {
        let mut deps = step.needs.clone();
        for expr in step.bindings.values() {
            collect_step_refs(expr, &mut deps);
        }
        if let Some(iterate) = &step.iterate {
            collect_step_refs(&iterate.expr, &mut deps);
        }
        if let Some(guard) = &step.guard {
            deps.insert(guard.step);
        }
        deps.retain(|dep| known.contains(dep) && *dep != step.index);
        needs.insert(step.index, deps);
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut placed: BTreeSet<usize> = BTreeSet::new();
    while order.len() < steps.len() {
        let ready: Vec<usize> = needs
            .iter()
            .filter(|(index, deps)| {
                !placed.contains(*index) && deps.iter().all(|dep| placed.contains(dep))
            })
            .map(|(index, _)| *index)
            .collect();
        if ready.is_empty() {
            let stuck = needs
                .keys()
                .find(|index| !placed.contains(*index))
                .copied()
                .unwrap_or_default();
            return Err(PathwayError::DependencyCycle(stuck));
        }
        for index in ready {
            placed.insert(index);
            order.push(index);
        }
    }
    Ok(order)
}

fn collect_step_refs(expr: &str, deps: &mut BTreeSet<usize>) {
    let mut rest = expr;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            return;
        };
        let reference = &rest[start + 1..start + end];
        if let Some(tail) = reference.trim().strip_prefix("step ") {
            let index_part = tail
                .split('.')
                .next()
                .unwrap_or_default()
                .trim();
            if let Ok(index) = index_part.parse::<usize>() {
                deps.insert(index);
            }
        }
        rest = &rest[start + end + 1..];
    }
}

fn lookup_step_field(
    outputs: &BTreeMap<usize, Value>,
    step: usize,
    field: Option<&str>,
) -> Result<Value, String> {
    let output = outputs
        .get(&step)
        .ok_or_else(|| format!("step {step} has no recorded output"))?;
    match field {
        None => Ok(output.clone()),
        Some(field) => output
            .get(field)
            .cloned()
            .ok_or_else(|| format!("step {step} output has no field '{field}'")),
    }
}

/// Resolve one `{...}` reference: iteration variable, `step N.field`, or a
/// pathway input field, in that order.
fn resolve_reference(
    expr: &str,
    input: &Value,
    outputs: &BTreeMap<usize, Value>,
    iteration: Option<(&str, &Value)>,
) -> Result<Value, String> {
    let reference = expr
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
        .ok_or_else(|| format!("'{expr}' is not a reference"))?;

    if let Some((variable, value)) = iteration {
        if reference == variable {
            return Ok((*value).clone());
        }
    }
    if let Some(tail) = reference.strip_prefix("step ") {
        let (index_part, field) = match tail.split_once('.') {
            Some((index_part, field)) => (index_part.trim(), Some(field.trim())),
            None => (tail.trim(), None),
        };
        let index: usize = index_part
            .parse()
            .map_err(|_| format!("bad step reference '{reference}'"))?;
        return lookup_step_field(outputs, index, field);
    }
    input
        .get(reference)
        .cloned()
        .ok_or_else(|| format!("no pathway input named '{reference}'"))
}

/// Bind a step's declared parameters. Full-reference expressions keep their
/// JSON type; mixed text interpolates; anything else passes through as a
/// literal string. Steps with no bindings receive the whole pathway input.
fn bind_step_input(
    step: &PathwayStep,
    input: &Value,
    outputs: &BTreeMap<usize, Value>,
    iteration: Option<(&str, &Value)>,
) -> Result<String, String> {
    if step.bindings.is_empty() {
        let mut value = input.clone();
        if let (Some((variable, item)), Value::Object(object)) = (iteration, &mut value) {
            object.insert(variable.to_string(), (*item).clone());
        }
        return serde_json::to_string(&value).map_err(|err| err.to_string());
    }

    let mut bound = serde_json::Map::new();
    for (param, expr) in &step.bindings {
        let value = resolve_binding_expr(expr, input, outputs, iteration)?;
        bound.insert(param.clone(), value);
    }
    serde_json::to_string(&Value::Object(bound)).map_err(|err| err.to_string())
}

fn resolve_binding_expr(
    expr: &str,
    input: &Value,
    outputs: &BTreeMap<usize, Value>,
    iteration: Option<(&str, &Value)>,
) -> Result<Value, String> {
    let trimmed = expr.trim();
    let is_full_reference = trimmed.starts_with('{')
        && trimmed.ends_with('}')
        && trimmed.matches('{').count() == 1;
    if is_full_reference {
        return resolve_reference(trimmed, input, outputs, iteration);
    }
    if !trimmed.contains('{') {
        return Ok(Value::String(trimmed.to_string()));
    }
    // Interpolation: replace each {ref} with its stringified value.
    let mut result = String::new();
    let mut rest = trimmed;
    while let Some(start) = rest.find('{') {
        result.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            return Err(format!("unbalanced braces in '{expr}'"));
        };
        let reference = &rest[start..start + end + 1];
        let value = resolve_reference(reference, input, outputs, iteration)?;
        match value {
            Value::String(text) => result.push_str(&text),
            other => result.push_str(&other.to_string()),
        }
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    Ok(Value::String(result))
}

/// Resolve a verify block's parameter map against the triggering input:
/// `{"interface": "{bridge_name}"}` + `{"bridge_name": "br0"}` →
/// `{"interface": "br0"}`.
pub fn resolve_verify_params(
    params: &BTreeMap<String, String>,
    input: &str,
) -> Result<String, String> {
    let input: Value = serde_json::from_str(input).map_err(|err| err.to_string())?;
    let empty = BTreeMap::new();
    let mut resolved = serde_json::Map::new();
    for (name, expr) in params {
        let value = resolve_binding_expr(expr, &input, &empty, None)?;
        resolved.insert(name.clone(), value);
    }
    serde_json::to_string(&Value::Object(resolved)).map_err(|err| err.to_string())
}

fn mark_dependents_dead(steps: &[PathwayStep], failed: usize, dead: &mut BTreeSet<usize>) {
    let mut frontier = vec![failed];
    while let Some(current) = frontier.pop() {
        for step in steps {
            if dead.contains(&step.index) || step.index == failed {
                continue;
            }
            let mut deps = step.needs.clone();
            for expr in step.bindings.values() {
                collect_step_refs(expr, &mut deps);
            }
            if let Some(iterate) = &step.iterate {
                collect_step_refs(&iterate.expr, &mut deps);
            }
            if let Some(guard) = &step.guard {
                deps.insert(guard.step);
            }
            if deps.contains(&current) {
                dead.insert(step.index);
                frontier.push(step.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use operon_contract::{FailurePolicy, GuardSpec, IterationSpec, RiskClass};
    use operon_safety::UndoOp;
    use serde_json::json;
    use std::collections::HashMap;

    struct ScriptedInvoker {
        /// locus → list of scripted results, consumed in order; the last
        /// entry repeats.
        script: Mutex<HashMap<String, Vec<Result<Value, StepFault>>>>,
        invocations: Mutex<Vec<(String, String)>>,
        capability: Arc<CountingCapability>,
        open_transactions: bool,
    }

    struct CountingCapability {
        log: Mutex<Vec<String>>,
    }

    impl Capability for CountingCapability {
        fn call(
            &self,
            operation: &str,
            _args: &[Value],
        ) -> Result<Value, operon_sandbox::CapabilityFault> {
            self.log.lock().unwrap().push(operation.to_string());
            Ok(Value::Null)
        }
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                invocations: Mutex::new(Vec::new()),
                capability: Arc::new(CountingCapability {
                    log: Mutex::new(Vec::new()),
                }),
                open_transactions: false,
            }
        }

        fn with_transactions(mut self) -> Self {
            self.open_transactions = true;
            self
        }

        fn script(self, locus: &str, results: Vec<Result<Value, StepFault>>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(locus.to_string(), results);
            self
        }
    }

    #[async_trait]
    impl StepInvoker for ScriptedInvoker {
        async fn invoke_locus(
            &self,
            locus: &str,
            input: &str,
        ) -> Result<StepExecution, StepFault> {
            self.invocations
                .lock()
                .unwrap()
                .push((locus.to_string(), input.to_string()));
            let mut script = self.script.lock().unwrap();
            let results = script.get_mut(locus);
            let result = match results {
                Some(results) if results.len() > 1 => results.remove(0),
                Some(results) => results[0].clone(),
                None => Ok(json!({ "success": true, "locus": locus })),
            };
            drop(script);
            let output = result?;
            let transaction = if self.open_transactions {
                let transaction = Arc::new(Mutex::new(Transaction::new(locus)));
                transaction.lock().unwrap().record(
                    format!("undo {locus}"),
                    UndoOp {
                        operation: format!("undo_{locus}"),
                        args: Vec::new(),
                    },
                );
                Some(PendingTransaction {
                    transaction,
                    capability: self.capability.clone(),
                })
            } else {
                None
            };
            Ok(StepExecution {
                output,
                digest: format!("digest-{locus}"),
                transaction,
            })
        }

        async fn invoke_fused(
            &self,
            pathway: &str,
            _digest: &str,
            input: &str,
        ) -> Result<Value, StepFault> {
            self.invocations
                .lock()
                .unwrap()
                .push((format!("fused:{pathway}"), input.to_string()));
            let mut script = self.script.lock().unwrap();
            let key = format!("fused:{pathway}");
            match script.get_mut(&key) {
                Some(results) if results.len() > 1 => results.remove(0),
                Some(results) => results[0].clone(),
                None => Err(StepFault::Failed("no fused script".into())),
            }
        }
    }

    fn gene_step(index: usize, locus: &str) -> PathwayStep {
        PathwayStep {
            index,
            name: locus.to_string(),
            target: StepTarget::Locus(locus.to_string()),
            bindings: BTreeMap::new(),
            iterate: None,
            guard: None,
            needs: BTreeSet::new(),
        }
    }

    fn pathway(name: &str, steps: Vec<PathwayStep>, policy: FailurePolicy) -> PathwayContract {
        PathwayContract {
            name: name.to_string(),
            risk: RiskClass::Low,
            does: "test pathway".into(),
            takes: Vec::new(),
            steps,
            verify: Vec::new(),
            verify_within: None,
            on_failure: policy,
        }
    }

    fn executor(contract: PathwayContract) -> (PathwayExecutor, Arc<FusionTracker>) {
        let root = std::env::temp_dir().join(format!(
            "operon-pathway-{}-{}",
            contract.name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        let phenotype = Arc::new(PhenotypeMap::open(root.join("phenotype.toml")).unwrap());
        let tracker = Arc::new(
            FusionTracker::open(root.join("fusion_tracker.json"), phenotype.clone()).unwrap(),
        );
        let mut contracts = ContractSet::new();
        contracts.insert_pathway(contract);
        (
            PathwayExecutor::new(Arc::new(contracts), phenotype, tracker.clone()),
            tracker,
        )
    }

    #[tokio::test]
    async fn linear_pathway_threads_outputs_through_bindings() {
        let mut second = gene_step(2, "second");
        second
            .bindings
            .insert("bridge".into(), "{step 1.bridge}".into());
        second.bindings.insert("label".into(), "fixed".into());
        let contract = pathway(
            "linear",
            vec![gene_step(1, "first"), second],
            FailurePolicy::RollbackAll,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new().script(
            "first",
            vec![Ok(json!({ "success": true, "bridge": "br0" }))],
        );

        let result = executor
            .run(&invoker, "linear", r#"{"x": 1}"#)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            result.composition,
            vec!["digest-first".to_string(), "digest-second".to_string()]
        );
        let invocations = invoker.invocations.lock().unwrap();
        let second_input: Value = serde_json::from_str(&invocations[1].1).unwrap();
        assert_eq!(second_input, json!({ "bridge": "br0", "label": "fixed" }));
    }

    #[tokio::test]
    async fn implicit_references_order_the_dag() {
        // Declared out of order: step 2 feeds step 1.
        let mut first = gene_step(1, "consumer");
        first
            .bindings
            .insert("value".into(), "{step 2.value}".into());
        let contract = pathway(
            "dag",
            vec![first, gene_step(2, "producer")],
            FailurePolicy::RollbackAll,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new()
            .script("producer", vec![Ok(json!({ "success": true, "value": 7 }))]);

        let result = executor.run(&invoker, "dag", r#"{}"#).await.unwrap();
        assert!(result.success);
        let invocations = invoker.invocations.lock().unwrap();
        assert_eq!(invocations[0].0, "producer");
        assert_eq!(invocations[1].0, "consumer");
        let consumer_input: Value = serde_json::from_str(&invocations[1].1).unwrap();
        assert_eq!(consumer_input["value"], json!(7));
    }

    #[tokio::test]
    async fn false_guard_skips_the_step() {
        let mut guarded = gene_step(2, "guarded");
        guarded.guard = Some(GuardSpec {
            step: 1,
            field: "go".into(),
            equals: json!(true),
        });
        let contract = pathway(
            "guards",
            vec![gene_step(1, "probe"), guarded],
            FailurePolicy::RollbackAll,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new().script(
            "probe",
            vec![Ok(json!({ "success": true, "go": false }))],
        );

        let result = executor.run(&invoker, "guards", r#"{}"#).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(invoker.invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn iteration_runs_once_per_element() {
        let mut batch = gene_step(1, "per_item");
        batch.iterate = Some(IterationSpec {
            variable: "item".into(),
            expr: "{targets}".into(),
        });
        batch.bindings.insert("target".into(), "{item}".into());
        let contract = pathway("batch", vec![batch], FailurePolicy::RollbackAll);
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new();

        let result = executor
            .run(&invoker, "batch", r#"{"targets": ["a", "b", "c"]}"#)
            .await
            .unwrap();
        assert!(result.success);
        let invocations = invoker.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 3);
        let first: Value = serde_json::from_str(&invocations[0].1).unwrap();
        assert_eq!(first, json!({ "target": "a" }));
        let output = result.steps[0].output.as_ref().unwrap();
        assert_eq!(output.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rollback_all_drains_prior_transactions_in_reverse() {
        let contract = pathway(
            "txn",
            vec![gene_step(1, "first"), gene_step(2, "second")],
            FailurePolicy::RollbackAll,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new()
            .with_transactions()
            .script(
                "second",
                vec![Err(StepFault::Exhausted {
                    locus: "second".into(),
                    last_error: "boom".into(),
                })],
            );

        let result = executor.run(&invoker, "txn", r#"{}"#).await.unwrap();
        assert!(!result.success);
        let log = invoker.capability.log.lock().unwrap();
        assert_eq!(log.as_slice(), &["undo_first"]);
    }

    #[tokio::test]
    async fn report_partial_skips_dependents_and_keeps_independents() {
        let mut dependent = gene_step(2, "dependent");
        dependent
            .bindings
            .insert("x".into(), "{step 1.value}".into());
        let contract = pathway(
            "partial",
            vec![gene_step(1, "flaky"), dependent, gene_step(3, "independent")],
            FailurePolicy::ReportPartial,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new().script(
            "flaky",
            vec![Err(StepFault::Failed("nope".into()))],
        );

        let result = executor.run(&invoker, "partial", r#"{}"#).await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.steps[0].status, StepStatus::Failed { .. }));
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.steps[2].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn missing_reference_is_fatal() {
        let mut step = gene_step(1, "needs_input");
        step.bindings.insert("x".into(), "{absent}".into());
        let contract = pathway("binding", vec![step], FailurePolicy::RollbackAll);
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new();

        let err = executor.run(&invoker, "binding", r#"{}"#).await.unwrap_err();
        assert!(matches!(err, PathwayError::Binding(_)));
    }

    #[tokio::test]
    async fn fused_allele_runs_first_and_decomposes_on_failure() {
        let contract = pathway(
            "fusable",
            vec![gene_step(1, "first"), gene_step(2, "second")],
            FailurePolicy::RollbackAll,
        );
        let (executor, tracker) = executor(contract);
        tracker.install_fused("fusable", "fff").unwrap();

        // First run: fused path succeeds, steps untouched.
        let invoker = ScriptedInvoker::new()
            .script("fused:fusable", vec![Ok(json!({ "success": true }))]);
        let result = executor.run(&invoker, "fusable", r#"{}"#).await.unwrap();
        assert!(result.success && result.used_fused);
        assert_eq!(result.composition, vec!["fff".to_string()]);

        // Second run: fused path fails, the run falls through to steps and
        // the fused slot clears.
        let invoker = ScriptedInvoker::new()
            .script("fused:fusable", vec![Err(StepFault::Failed("broken".into()))]);
        let result = executor.run(&invoker, "fusable", r#"{}"#).await.unwrap();
        assert!(result.success);
        assert!(!result.used_fused);
        assert_eq!(tracker.state("fusable").unwrap().fused_allele, None);

        // Third run goes straight to the decomposed form.
        let invoker = ScriptedInvoker::new();
        let result = executor.run(&invoker, "fusable", r#"{}"#).await.unwrap();
        assert!(!result.used_fused);
        assert_eq!(invoker.invocations.lock().unwrap()[0].0, "first");
    }

    #[tokio::test]
    async fn two_clean_runs_increment_reinforcement_by_two() {
        let contract = pathway(
            "reinforce",
            vec![gene_step(1, "a"), gene_step(2, "b")],
            FailurePolicy::RollbackAll,
        );
        let (executor, tracker) = executor(contract);
        let invoker = ScriptedInvoker::new();

        executor.run(&invoker, "reinforce", r#"{}"#).await.unwrap();
        executor.run(&invoker, "reinforce", r#"{}"#).await.unwrap();
        assert_eq!(tracker.state("reinforce").unwrap().consecutive_successes, 2);
    }

    #[tokio::test]
    async fn cancellation_rolls_back_open_transactions() {
        let contract = pathway(
            "cancel",
            vec![gene_step(1, "first"), gene_step(2, "second")],
            FailurePolicy::RollbackAll,
        );
        let (executor, _) = executor(contract);
        let invoker = ScriptedInvoker::new().with_transactions();

        // Cancel before the run starts: no step executes.
        let cancel = AtomicBool::new(true);
        let err = executor
            .run_cancellable(&invoker, "cancel", r#"{}"#, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PathwayError::Cancelled(_)));
        assert!(invoker.invocations.lock().unwrap().is_empty());
    }
}
