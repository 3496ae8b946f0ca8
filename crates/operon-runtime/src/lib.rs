//! The organism: process-wide handle binding the registry, phenotype map,
//! arena, fusion tracker, pathway executor, sandbox, and mutation driver
//! over a single project root. `open(root)` wires the persistent layout
//! (`.sg/registry/`, `phenotype.toml`, `fusion_tracker.json`,
//! `.sg/regression.json`). The execution loop invokes the dominant allele,
//! validates its output, scores the outcome, falls back down the stack on
//! failure, and hands exhausted loci to the mutation driver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use operon_arena::{
    Arena, ArenaConfig, ArenaError, ArenaEvent, ObservationTicket, TemporalTracking,
};
use operon_contract::{
    validate_output, ContractSet, GeneContract, GeneFamily, RiskClass, Timescale,
};
use operon_fusion::{FusionError, FusionSignal, FusionTracker};
use operon_mutation::{
    MutationDriver, MutationEngine, MutationError, MutationRequest, MutationTrigger,
    PromptDocument,
};
use operon_pathway::{
    PathwayError, PathwayExecutor, PathwayResult, PendingTransaction, StepExecution,
    StepFault, StepInvoker, VerifyRequest,
};
use operon_phenotype::{PhenotypeError, PhenotypeMap};
use operon_registry::{
    digest_source, AlleleState, Digest, NewAllele, PeerSummary, Registry, RegistryError,
};
use operon_safety::{InverseTable, SafetyConfig, Transaction, TransactionalCapability};
use operon_sandbox::{Capability, CapabilityFault, GeneLoader};

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub sandbox_timeout: Duration,
    /// Retry the failing invocation synchronously on a freshly installed
    /// mutant. Off by default; callers opt in.
    pub retry_after_mutation: bool,
    pub safety: SafetyConfig,
    pub arena: ArenaConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sandbox_timeout: operon_sandbox::DEFAULT_TIMEOUT,
            retry_after_mutation: false,
            safety: SafetyConfig::default(),
            arena: ArenaConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invocation failed: {0}")]
    Invocation(String),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Phenotype(#[from] PhenotypeError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Pathway(#[from] PathwayError),
}

impl RuntimeError {
    /// Process exit code when a front end drives the runtime: 0 success,
    /// 1 generic failure, 2 invocation/validation failure, 3 integrity
    /// failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Invocation(_) => 2,
            RuntimeError::Pathway(PathwayError::Binding(_)) => 2,
            RuntimeError::Integrity(_) => 3,
            _ => 1,
        }
    }
}

/// Hook for the externally driven verification timer. The core emits
/// schedule requests; whoever owns the clock fires them back through
/// [`Organism::run_verification`].
pub trait VerifyScheduler: Send + Sync {
    fn schedule(&self, request: VerifyRequest);
}

/// Collects requests for a driver (or test) to drain and fire manually.
#[derive(Default)]
pub struct QueueVerifyScheduler {
    pending: Mutex<Vec<VerifyRequest>>,
}

impl QueueVerifyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<VerifyRequest> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }
}

impl VerifyScheduler for QueueVerifyScheduler {
    fn schedule(&self, request: VerifyRequest) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(request);
        }
    }
}

/// Capability that accepts every operation and returns null. Stands in for
/// the mock capability in shadow runs when none is supplied.
pub struct InertCapability;

impl Capability for InertCapability {
    fn call(&self, _operation: &str, _args: &[Value]) -> Result<Value, CapabilityFault> {
        Ok(Value::Null)
    }
}

enum Attempt {
    Success(StepExecution),
    Failure(String),
}

pub struct Organism {
    config: RuntimeConfig,
    contracts: Arc<ContractSet>,
    registry: Arc<Registry>,
    phenotype: Arc<PhenotypeMap>,
    arena: Arc<Arena>,
    tracker: Arc<FusionTracker>,
    loader: Arc<GeneLoader>,
    driver: Arc<MutationDriver>,
    executor: PathwayExecutor,
    capability: Arc<dyn Capability>,
    shadow_capability: Arc<dyn Capability>,
    inverse_table: Arc<InverseTable>,
    scheduler: Arc<dyn VerifyScheduler>,
    pending_convergence: Mutex<HashMap<Digest, Vec<ObservationTicket>>>,
    dirty: AtomicBool,
}

impl Organism {
    /// Open an organism over `root`. Creates the persistent layout on first
    /// use; repairs the phenotype against the registry on every open.
    pub fn open(
        root: impl Into<PathBuf>,
        contracts: ContractSet,
        capability: Arc<dyn Capability>,
        engine: Arc<dyn MutationEngine>,
    ) -> Result<Self, RuntimeError> {
        let root = root.into();
        let config = RuntimeConfig::default();
        let registry = Arc::new(Registry::open(root.join(".sg").join("registry"))?);
        let phenotype = Arc::new(PhenotypeMap::open(root.join("phenotype.toml"))?);
        {
            let registry = registry.clone();
            let removed = phenotype.repair(move |digest| {
                registry.contains(digest).unwrap_or(false)
            })?;
            if !removed.is_empty() {
                warn!(count = removed.len(), "phenotype repair dropped unknown digests");
            }
        }
        let arena = Arc::new(
            Arena::with_config(registry.clone(), phenotype.clone(), config.arena.clone())
                .with_regression_log(root.join(".sg").join("regression.json")),
        );
        let tracker = Arc::new(FusionTracker::open(
            root.join("fusion_tracker.json"),
            phenotype.clone(),
        )?);
        let contracts = Arc::new(contracts);
        let driver = Arc::new(MutationDriver::new(
            registry.clone(),
            phenotype.clone(),
            engine,
        ));
        let executor =
            PathwayExecutor::new(contracts.clone(), phenotype.clone(), tracker.clone());
        Ok(Self {
            config,
            contracts,
            registry,
            phenotype,
            arena,
            tracker,
            loader: Arc::new(GeneLoader::new()),
            driver,
            executor,
            capability,
            shadow_capability: Arc::new(InertCapability),
            inverse_table: Arc::new(InverseTable::new()),
            scheduler: Arc::new(QueueVerifyScheduler::new()),
            pending_convergence: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_inverse_table(mut self, table: InverseTable) -> Self {
        self.inverse_table = Arc::new(table);
        self
    }

    pub fn with_shadow_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.shadow_capability = capability;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn VerifyScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn phenotype(&self) -> &PhenotypeMap {
        &self.phenotype
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn fusion(&self) -> &FusionTracker {
        &self.tracker
    }

    /// True after a rollback failed to restore the environment completely.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Flush durable state and release the handle.
    pub fn close(self) -> Result<(), RuntimeError> {
        self.registry.flush()?;
        Ok(())
    }

    /// Register a seed allele and make it dominant for its locus.
    pub fn install_seed(&self, locus: &str, source: &str) -> Result<Digest, RuntimeError> {
        let digest = self.registry.put(
            source,
            NewAllele {
                locus: locus.to_string(),
                ..NewAllele::default()
            },
        )?;
        self.phenotype.promote(locus, &digest)?;
        self.registry.set_state(&digest, AlleleState::Dominant)?;
        info!(locus, %digest, "seed allele installed");
        Ok(digest)
    }

    /// Import an allele shared by a peer. The claimed digest must match the
    /// source; a mismatch is an integrity failure (exit code 3). Imports
    /// enter as recessive and compete on local fitness.
    pub fn import_allele(
        &self,
        locus: &str,
        source: &str,
        claimed_digest: &str,
    ) -> Result<Digest, RuntimeError> {
        let actual = digest_source(source);
        if actual != claimed_digest {
            return Err(RuntimeError::Integrity(format!(
                "digest mismatch on import: claimed {claimed_digest}, computed {actual}"
            )));
        }
        let digest = self.registry.put(
            source,
            NewAllele {
                locus: locus.to_string(),
                ..NewAllele::default()
            },
        )?;
        self.phenotype.add_fallback(locus, &digest)?;
        Ok(digest)
    }

    pub fn import_peer_summary(
        &self,
        digest: &str,
        summary: PeerSummary,
    ) -> Result<(), RuntimeError> {
        self.registry.set_peer_summary(digest, summary)?;
        Ok(())
    }

    /// Execute a single gene through its allele stack, committing any
    /// transaction on success.
    pub async fn execute_gene(
        &self,
        locus: &str,
        input: &str,
    ) -> Result<(Value, Digest), RuntimeError> {
        match self.execute_stack(locus, input, false).await {
            Ok(execution) => Ok((execution.output, execution.digest)),
            Err(fault) => Err(RuntimeError::Invocation(fault.to_string())),
        }
    }

    /// Run a named pathway. Fusion requests raised by the tracker are
    /// fulfilled before returning; verification requests are handed to the
    /// scheduler hook.
    pub async fn run_pathway(
        &self,
        name: &str,
        input: &str,
    ) -> Result<PathwayResult, RuntimeError> {
        let result = self.executor.run(self, name, input).await?;
        if let Some(FusionSignal::FuseRequest {
            pathway,
            composition,
        }) = &result.fusion_signal
        {
            if let Err(err) = self.fulfil_fusion(pathway, composition).await {
                warn!(%pathway, error = %err, "fusion synthesis failed");
            }
        }
        for request in &result.verify {
            self.scheduler.schedule(request.clone());
        }
        Ok(result)
    }

    /// Fire a scheduled verification: run the diagnostic and feed its
    /// verdict into the subject's pending temporal slots.
    pub async fn run_verification(&self, request: &VerifyRequest) -> Result<(), RuntimeError> {
        let healthy = match self.execute_stack(&request.locus, &request.input, false).await {
            Ok(execution) => execution
                .output
                .get("healthy")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            Err(fault) => {
                warn!(locus = %request.locus, error = %fault, "verification diagnostic failed");
                false
            }
        };

        let tickets = {
            let mut pending = self
                .pending_convergence
                .lock()
                .map_err(|_| RuntimeError::Invocation("pending-verification lock poisoned".into()))?;
            pending.remove(&request.subject_digest).unwrap_or_default()
        };
        let feeds_resilience = self
            .contracts
            .gene(&request.locus)
            .map(|diagnostic| {
                diagnostic.feeds.iter().any(|feed| {
                    feed.target_locus == request.subject_locus
                        && feed.timescale == Timescale::Resilience
                })
            })
            .unwrap_or(false);
        for ticket in tickets {
            let events = self.arena.record_convergence(&ticket, healthy)?;
            self.handle_events(&ticket.locus, &events, None).await;
            if feeds_resilience {
                let events = self.arena.record_resilience(&ticket, healthy)?;
                self.handle_events(&ticket.locus, &events, None).await;
            }
        }
        Ok(())
    }

    /// Expire overdue pending slots for every known locus.
    pub fn expire_pending(&self, now: DateTime<Utc>) -> Result<(), RuntimeError> {
        for locus in self.phenotype.loci()? {
            self.arena.expire_pending(&locus, now)?;
        }
        Ok(())
    }

    pub fn sweep_deprecated(&self, now: DateTime<Utc>) -> Result<Vec<Digest>, RuntimeError> {
        Ok(self.arena.sweep_deprecated(now)?)
    }

    /// One shadow trial against the mock capability. Enough consecutive
    /// successes advance the allele to canary and put it in the live stack.
    pub async fn qualify_shadow(&self, digest: &str, input: &str) -> Result<bool, RuntimeError> {
        let record = self
            .registry
            .get(digest)?
            .ok_or_else(|| RegistryError::UnknownDigest(digest.to_string()))?;
        if record.state != AlleleState::Shadow {
            return Err(RuntimeError::Invocation(format!(
                "allele {digest} is not in shadow"
            )));
        }
        let source = self
            .registry
            .source(digest)?
            .ok_or_else(|| RegistryError::UnknownDigest(digest.to_string()))?;
        let ok = match self.loader.load(digest, &source) {
            Ok(gene) => {
                match operon_sandbox::invoke(
                    &gene,
                    input.to_string(),
                    self.shadow_capability.clone(),
                    self.config.sandbox_timeout,
                )
                .await
                {
                    Ok(output) => serde_json::from_str::<Value>(&output)
                        .ok()
                        .and_then(|value| value.get("success").and_then(Value::as_bool))
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
            Err(_) => false,
        };

        if ok {
            let count = self.registry.record_shadow_success(digest)?;
            if count >= self.config.safety.shadow_qualification_runs {
                self.registry.set_state(digest, AlleleState::Canary)?;
                self.phenotype.add_fallback(&record.locus, digest)?;
                info!(locus = %record.locus, %digest, "shadow allele advanced to canary");
            }
        } else {
            self.registry.reset_shadow_successes(digest)?;
        }
        Ok(ok)
    }

    // --- internals ---

    async fn execute_stack(
        &self,
        locus: &str,
        input: &str,
        defer_commit: bool,
    ) -> Result<StepExecution, StepFault> {
        let contract = self
            .contracts
            .gene(locus)
            .ok_or_else(|| StepFault::Failed(format!("no contract for locus '{locus}'")))?;
        let mut stack = self
            .phenotype
            .resolve_with_stack(locus)
            .map_err(internal)?;

        if stack.is_empty() {
            // Exhausted before we start: hand off to the mutation driver.
            let installed = self
                .trigger_mutation(
                    contract,
                    MutationTrigger::Exhausted,
                    Some(input),
                    Some("no alleles installed".into()),
                    None,
                )
                .await;
            match installed {
                Some(digest) if self.config.retry_after_mutation => stack = vec![digest],
                _ => {
                    return Err(StepFault::Exhausted {
                        locus: locus.to_string(),
                        last_error: "no alleles installed".into(),
                    })
                }
            }
        }

        let tracking = self.tracking_for(contract);
        let mut last_error = String::from("empty allele stack");
        for digest in stack {
            let Some(record) = self.registry.get(&digest).map_err(internal)? else {
                continue;
            };
            // Shadow alleles only ever run against the mock capability.
            if record.state == AlleleState::Shadow {
                continue;
            }
            match self
                .attempt(contract, locus, &digest, input, tracking, defer_commit)
                .await?
            {
                Attempt::Success(execution) => {
                    if record.state == AlleleState::Canary {
                        self.advance_canary(&digest).map_err(internal)?;
                    }
                    return Ok(execution);
                }
                Attempt::Failure(error) => {
                    last_error = error;
                    continue;
                }
            }
        }

        Err(StepFault::Exhausted {
            locus: locus.to_string(),
            last_error,
        })
    }

    async fn attempt(
        &self,
        contract: &GeneContract,
        locus: &str,
        digest: &str,
        input: &str,
        tracking: TemporalTracking,
        defer_commit: bool,
    ) -> Result<Attempt, StepFault> {
        let Some(source) = self.registry.source(digest).map_err(internal)? else {
            return Ok(Attempt::Failure(format!("source missing for {digest}")));
        };
        let gene = match self.loader.load(digest, &source) {
            Ok(gene) => gene,
            Err(err) => {
                let error = err.to_string();
                self.score_failure(locus, digest, tracking, input, &error).await?;
                return Ok(Attempt::Failure(error));
            }
        };

        let wrap = contract.risk.requires_transaction()
            && contract.family == GeneFamily::Configuration;
        let transaction = wrap.then(|| Arc::new(Mutex::new(Transaction::new(locus))));
        let capability: Arc<dyn Capability> = match &transaction {
            Some(transaction) => Arc::new(TransactionalCapability::new(
                self.capability.clone(),
                self.inverse_table.clone(),
                transaction.clone(),
            )),
            None => self.capability.clone(),
        };
        let timeout = contract
            .sandbox_timeout()
            .ok()
            .flatten()
            .unwrap_or(self.config.sandbox_timeout);

        let outcome =
            operon_sandbox::invoke(&gene, input.to_string(), capability, timeout).await;
        let (output, error) = match outcome {
            Ok(text) => match validate_output(contract, &text) {
                Ok(value) => {
                    let succeeded = value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if succeeded {
                        (Some(value), None)
                    } else {
                        let reason = value
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("gene reported failure")
                            .to_string();
                        (None, Some(reason))
                    }
                }
                Err(violation) => (None, Some(violation.to_string())),
            },
            Err(sandbox_error) => (None, Some(sandbox_error.to_string())),
        };

        match output {
            Some(value) => {
                self.score_success(locus, digest, tracking, input).await?;
                let pending = transaction.map(|transaction| PendingTransaction {
                    transaction,
                    capability: self.capability.clone(),
                });
                if !defer_commit {
                    if let Some(pending) = &pending {
                        pending.commit();
                    }
                }
                Ok(Attempt::Success(StepExecution {
                    output: value,
                    digest: digest.to_string(),
                    transaction: if defer_commit { pending } else { None },
                }))
            }
            None => {
                let error = error.unwrap_or_else(|| "invocation failed".into());
                if let Some(transaction) = &transaction {
                    if let Ok(mut transaction) = transaction.lock() {
                        let report = transaction.rollback(self.capability.as_ref());
                        if !report.is_clean() {
                            self.dirty.store(true, Ordering::Relaxed);
                            warn!(
                                locus,
                                failures = report.failures.len(),
                                "rollback incomplete, state marked dirty"
                            );
                        }
                    }
                }
                if self
                    .registry
                    .get(digest)
                    .map_err(internal)?
                    .map(|record| record.state == AlleleState::Canary)
                    .unwrap_or(false)
                {
                    self.registry.reset_canary_successes(digest).map_err(internal)?;
                }
                info!(locus, %digest, %error, "allele attempt failed");
                self.score_failure(locus, digest, tracking, input, &error).await?;
                Ok(Attempt::Failure(error))
            }
        }
    }

    fn tracking_for(&self, contract: &GeneContract) -> TemporalTracking {
        let verified =
            contract.family == GeneFamily::Configuration && !contract.verify.is_empty();
        TemporalTracking {
            convergence: verified,
            resilience: verified && contract.risk == RiskClass::Critical,
        }
    }

    async fn score_success(
        &self,
        locus: &str,
        digest: &str,
        tracking: TemporalTracking,
        input: &str,
    ) -> Result<(), StepFault> {
        let (ticket, events) = self
            .arena
            .record(locus, digest, true, tracking)
            .map_err(internal)?;
        if tracking.convergence {
            if let Ok(mut pending) = self.pending_convergence.lock() {
                pending
                    .entry(digest.to_string())
                    .or_default()
                    .push(ticket);
            }
        }
        self.handle_events(locus, &events, Some(input)).await;
        Ok(())
    }

    async fn score_failure(
        &self,
        locus: &str,
        digest: &str,
        tracking: TemporalTracking,
        input: &str,
        error: &str,
    ) -> Result<(), StepFault> {
        let (_, events) = self
            .arena
            .record(locus, digest, false, tracking)
            .map_err(internal)?;
        self.handle_failure_events(locus, &events, input, error).await;
        Ok(())
    }

    async fn handle_events(&self, locus: &str, events: &[ArenaEvent], input: Option<&str>) {
        for event in events {
            if let ArenaEvent::MildRegression { digest, .. } = event {
                let Some(contract) = self.contracts.gene(locus) else {
                    continue;
                };
                let _ = self
                    .trigger_mutation(
                        contract,
                        MutationTrigger::Regression,
                        input,
                        Some("fitness regressed from peak".into()),
                        Some(digest.clone()),
                    )
                    .await;
            }
        }
    }

    async fn handle_failure_events(
        &self,
        locus: &str,
        events: &[ArenaEvent],
        input: &str,
        error: &str,
    ) {
        for event in events {
            match event {
                ArenaEvent::LocusExhausted { last_digest, .. } => {
                    let Some(contract) = self.contracts.gene(locus) else {
                        continue;
                    };
                    let _ = self
                        .trigger_mutation(
                            contract,
                            MutationTrigger::Exhausted,
                            Some(input),
                            Some(error.to_string()),
                            Some(last_digest.clone()),
                        )
                        .await;
                }
                ArenaEvent::MildRegression { digest, .. } => {
                    let Some(contract) = self.contracts.gene(locus) else {
                        continue;
                    };
                    let _ = self
                        .trigger_mutation(
                            contract,
                            MutationTrigger::Regression,
                            Some(input),
                            Some(error.to_string()),
                            Some(digest.clone()),
                        )
                        .await;
                }
                _ => {}
            }
        }
    }

    async fn trigger_mutation(
        &self,
        contract: &GeneContract,
        trigger: MutationTrigger,
        failing_input: Option<&str>,
        error_summary: Option<String>,
        parent: Option<Digest>,
    ) -> Option<Digest> {
        let failing_source = match &parent {
            Some(parent) => self.registry.source(parent).ok().flatten(),
            None => None,
        };
        let request = MutationRequest {
            locus: contract.name.clone(),
            trigger,
            risk: contract.risk,
            parent,
            prompt: PromptDocument {
                locus: Some(contract.name.clone()),
                contract_text: serde_json::to_string(contract).unwrap_or_default(),
                failing_source,
                failing_input: failing_input.map(str::to_string),
                error_summary,
                ..PromptDocument::default()
            },
        };
        match self.driver.mutate(&request).await {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(locus = %contract.name, error = %err, "mutation attempt failed");
                None
            }
        }
    }

    async fn fulfil_fusion(
        &self,
        pathway: &str,
        composition: &[Digest],
    ) -> Result<(), RuntimeError> {
        let mut sources = Vec::with_capacity(composition.len());
        for digest in composition {
            let Some(source) = self.registry.source(digest)? else {
                return Err(RuntimeError::Integrity(format!(
                    "constituent source missing for {digest}"
                )));
            };
            sources.push(source);
        }
        let contract_text = self
            .contracts
            .pathway(pathway)
            .and_then(|contract| serde_json::to_string(contract).ok())
            .unwrap_or_default();
        let prompt = PromptDocument {
            pathway: Some(pathway.to_string()),
            contract_text,
            constituent_sources: sources,
            ..PromptDocument::default()
        };
        let digest = self
            .driver
            .synthesize_fused(pathway, composition, &prompt)
            .await?;
        self.tracker.install_fused(pathway, &digest)?;
        Ok(())
    }

    fn advance_canary(&self, digest: &str) -> Result<(), RegistryError> {
        let count = self.registry.record_canary_success(digest)?;
        if count >= self.config.safety.canary_qualification_runs {
            self.registry.set_state(digest, AlleleState::Recessive)?;
            info!(%digest, "canary allele advanced to recessive pool");
        }
        Ok(())
    }
}

#[async_trait]
impl StepInvoker for Organism {
    async fn invoke_locus(&self, locus: &str, input: &str) -> Result<StepExecution, StepFault> {
        // Transactions stay open so the pathway can apply its failure policy.
        self.execute_stack(locus, input, true).await
    }

    async fn invoke_fused(
        &self,
        pathway: &str,
        digest: &str,
        input: &str,
    ) -> Result<Value, StepFault> {
        let record = self
            .registry
            .get(digest)
            .map_err(internal)?
            .ok_or_else(|| StepFault::Failed(format!("fused allele {digest} unknown")))?;
        if !record.state.is_living() {
            return Err(StepFault::Failed(format!(
                "fused allele {digest} is deprecated"
            )));
        }
        let Some(source) = self.registry.source(digest).map_err(internal)? else {
            return Err(StepFault::Failed(format!("source missing for {digest}")));
        };
        let gene = self
            .loader
            .load(digest, &source)
            .map_err(|err| StepFault::Failed(err.to_string()))?;

        let risk = self
            .contracts
            .pathway(pathway)
            .map(|contract| contract.risk)
            .unwrap_or(RiskClass::Low);
        let transaction = risk
            .requires_transaction()
            .then(|| Arc::new(Mutex::new(Transaction::new(pathway))));
        let capability: Arc<dyn Capability> = match &transaction {
            Some(transaction) => Arc::new(TransactionalCapability::new(
                self.capability.clone(),
                self.inverse_table.clone(),
                transaction.clone(),
            )),
            None => self.capability.clone(),
        };

        let outcome = operon_sandbox::invoke(
            &gene,
            input.to_string(),
            capability,
            self.config.sandbox_timeout,
        )
        .await;
        let parsed = outcome.ok().and_then(|text| {
            serde_json::from_str::<Value>(&text)
                .ok()
                .filter(|value| {
                    value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
                })
        });

        // Score the fused allele's own fitness record. Locus lifecycle rules
        // do not apply here; the fuse/decompose cycle is the tracker's.
        let ok = parsed.is_some();
        self.registry
            .observe(
                digest,
                ok,
                operon_registry::SlotState::Untracked,
                operon_registry::SlotState::Untracked,
                Utc::now(),
            )
            .map_err(internal)?;

        match parsed {
            Some(value) => {
                if let Some(transaction) = &transaction {
                    if let Ok(mut transaction) = transaction.lock() {
                        transaction.commit();
                    }
                }
                Ok(value)
            }
            None => {
                if let Some(transaction) = &transaction {
                    if let Ok(mut transaction) = transaction.lock() {
                        let report = transaction.rollback(self.capability.as_ref());
                        if !report.is_clean() {
                            self.dirty.store(true, Ordering::Relaxed);
                        }
                    }
                }
                Err(StepFault::Failed(format!(
                    "fused allele {digest} failed"
                )))
            }
        }
    }
}

fn internal(err: impl std::fmt::Display) -> StepFault {
    StepFault::Failed(err.to_string())
}
