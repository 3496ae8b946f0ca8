//! End-to-end runs of the full evolutionary loop: seed genes executing in
//! the sandbox against a fake capability, scoring, demotion, mutation,
//! fusion, rollback, and sandbox denials.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use operon_contract::{
    ContractSet, FailurePolicy, FieldDef, FieldType, GeneContract, GeneFamily,
    PathwayContract, PathwayStep, RiskClass, StepTarget, VerifyStep,
};
use operon_mutation::{EngineFailure, MutationEngine, PromptDocument};
use operon_registry::digest_source;
use operon_runtime::{Organism, QueueVerifyScheduler, RuntimeError};
use operon_safety::{InverseTable, UndoOp};
use operon_sandbox::{Capability, CapabilityFault};

// --- test doubles -----------------------------------------------------------

/// Capability tracking created resources, with a log of every operation.
struct FakeCapability {
    resources: Mutex<Vec<String>>,
    log: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl FakeCapability {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            resources: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        })
    }
}

impl Capability for FakeCapability {
    fn call(&self, operation: &str, args: &[Value]) -> Result<Value, CapabilityFault> {
        let name = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.log.lock().unwrap().push(format!("{operation}:{name}"));
        if self.fail_on.lock().unwrap().as_deref() == Some(operation) {
            return Err(CapabilityFault::Failed("injected fault".into()));
        }
        match operation {
            "create" => {
                self.resources.lock().unwrap().push(name.clone());
                Ok(json!({ "created": name }))
            }
            "delete" => {
                self.resources.lock().unwrap().retain(|existing| existing != &name);
                Ok(json!({ "deleted": name }))
            }
            _ => Ok(json!({ "ok": true })),
        }
    }
}

/// Engine returning scripted sources, recording every prompt it sees.
struct ScriptedEngine {
    responses: Mutex<Vec<String>>,
    prompts: Mutex<Vec<PromptDocument>>,
}

impl ScriptedEngine {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl MutationEngine for ScriptedEngine {
    async fn generate(&self, prompt: &PromptDocument) -> Result<String, EngineFailure> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Err(EngineFailure::Failed("nothing scripted".into()))
        } else {
            Ok(responses.remove(0))
        }
    }
}

// --- contract and source fixtures -------------------------------------------

fn field(name: &str, ty: &str) -> FieldDef {
    FieldDef {
        name: name.into(),
        ty: FieldType::parse(ty).unwrap(),
        optional: false,
        default: None,
        doc: String::new(),
    }
}

fn gene(name: &str, family: GeneFamily, risk: RiskClass, gives: Vec<FieldDef>) -> GeneContract {
    GeneContract {
        name: name.into(),
        family,
        risk,
        does: format!("{name} test gene"),
        takes: Vec::new(),
        gives,
        before: Vec::new(),
        after: Vec::new(),
        fails_when: Vec::new(),
        unhealthy_when: Vec::new(),
        verify: Vec::new(),
        verify_within: None,
        feeds: Vec::new(),
        execution_timeout: None,
    }
}

fn two_step_pathway(name: &str, first: &str, second: &str) -> PathwayContract {
    let step = |index: usize, locus: &str| PathwayStep {
        index,
        name: locus.into(),
        target: StepTarget::Locus(locus.into()),
        bindings: BTreeMap::new(),
        iterate: None,
        guard: None,
        needs: Default::default(),
    };
    PathwayContract {
        name: name.into(),
        risk: RiskClass::Low,
        does: "two step test pathway".into(),
        takes: Vec::new(),
        steps: vec![step(1, first), step(2, second)],
        verify: Vec::new(),
        verify_within: None,
        on_failure: FailurePolicy::RollbackAll,
    }
}

const ECHO_X: &str = r#"
use json

fn execute(input) {
    let data = json::parse(input)
    if data.x == null {
        return json::dump({ success: false, error: "missing x" })
    }
    json::dump({ success: true, x: data.x })
}
"#;

const ALWAYS_FAIL: &str = r#"
use json

fn execute(input) {
    json::dump({ success: false, error: "unconditional failure" })
}
"#;

const CREATE_BRIDGE: &str = r#"
use json

fn execute(input) {
    let data = json::parse(input)
    let bridge = data.bridge_name
    if bridge == null {
        return json::dump({ success: false, error: "missing bridge_name" })
    }
    sdk.create(bridge)
    json::dump({ success: true, bridge: bridge })
}
"#;

const ENABLE_STP: &str = r#"
use json

fn execute(input) {
    let data = json::parse(input)
    sdk.configure(data.bridge_name)
    json::dump({ success: true, stp_enabled: true })
}
"#;

fn temp_root(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "operon-organism-{name}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);
    root
}

// --- scenarios ---------------------------------------------------------------

#[tokio::test]
async fn single_gene_successful_run() {
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "noop",
        GeneFamily::Diagnostic,
        RiskClass::None,
        vec![field("x", "int")],
    ));
    let organism = Organism::open(
        temp_root("single"),
        contracts,
        FakeCapability::new(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap();
    let digest = organism.install_seed("noop", ECHO_X).unwrap();

    let (output, used) = organism.execute_gene("noop", r#"{"x": 1}"#).await.unwrap();
    assert_eq!(output, json!({ "success": true, "x": 1 }));
    assert_eq!(used, digest);

    let record = organism.registry().get(&digest).unwrap().unwrap();
    assert_eq!(record.fitness.invocations, 1);
    assert_eq!(record.fitness.successes, 1);
    assert!((organism.arena().fitness(&digest).unwrap() - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn failure_cascade_demotes_and_calls_the_mutation_driver_once() {
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "always_fail",
        GeneFamily::Diagnostic,
        RiskClass::None,
        Vec::new(),
    ));
    let engine = ScriptedEngine::new(vec!["fn execute(input) { input }"]);
    let organism = Organism::open(
        temp_root("cascade"),
        contracts,
        FakeCapability::new(),
        engine.clone(),
    )
    .unwrap();
    let seed = organism.install_seed("always_fail", ALWAYS_FAIL).unwrap();

    let failing_input = r#"{"attempt": true}"#;
    for _ in 0..3 {
        let err = organism
            .execute_gene("always_fail", failing_input)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    // Third consecutive failure demoted the seed and exhausted the stack;
    // the driver ran exactly once, with the failing input in its prompt.
    let record = organism.registry().get(&seed).unwrap().unwrap();
    assert_eq!(record.fitness.consecutive_failures, 3);
    assert_eq!(engine.call_count(), 1);
    let prompt = engine.prompts.lock().unwrap()[0].clone();
    assert_eq!(prompt.failing_input.as_deref(), Some(failing_input));

    // The generated mutant entered the stack as recessive fallback.
    let stack = organism.phenotype().resolve_with_stack("always_fail").unwrap();
    assert_eq!(stack.len(), 1);
    assert_ne!(stack[0], seed);
    assert_eq!(organism.phenotype().resolve("always_fail").unwrap(), None);
}

#[tokio::test]
async fn fallback_takes_over_and_becomes_dominant() {
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "flappy",
        GeneFamily::Diagnostic,
        RiskClass::None,
        vec![field("x", "int")],
    ));
    let organism = Organism::open(
        temp_root("takeover"),
        contracts,
        FakeCapability::new(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap();
    let weak = organism.install_seed("flappy", ALWAYS_FAIL).unwrap();
    let strong = organism
        .import_allele("flappy", ECHO_X, &digest_source(ECHO_X))
        .unwrap();

    for _ in 0..60 {
        let (output, used) = organism.execute_gene("flappy", r#"{"x": 2}"#).await.unwrap();
        assert_eq!(output["x"], json!(2));
        assert_eq!(used, strong);
    }

    // The weak dominant accumulated three failures and was demoted; the
    // fallback carried every run and now holds the locus.
    assert_eq!(
        organism.phenotype().resolve("flappy").unwrap(),
        Some(strong.clone())
    );
    let record = organism.registry().get(&strong).unwrap().unwrap();
    assert_eq!(record.fitness.invocations, 60);
    assert!((organism.arena().fitness(&strong).unwrap() - 1.0).abs() < 1e-9);
    let weak_record = organism.registry().get(&weak).unwrap().unwrap();
    assert_eq!(weak_record.fitness.invocations, 3);
}

#[tokio::test]
async fn pathway_fuses_after_ten_runs_and_decomposes_on_fused_failure() {
    let fused_source = r#"
use json

fn execute(input) {
    let data = json::parse(input)
    if data.break_fused == true {
        return json::dump({ success: false, error: "fused fault" })
    }
    sdk.create(data.bridge_name)
    sdk.configure(data.bridge_name)
    json::dump({ success: true, bridge: data.bridge_name, stp_enabled: true })
}
"#;
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "bridge_create",
        GeneFamily::Configuration,
        RiskClass::Low,
        vec![field("bridge", "string")],
    ));
    contracts.insert_gene(gene(
        "bridge_stp",
        GeneFamily::Configuration,
        RiskClass::Low,
        vec![field("stp_enabled", "bool")],
    ));
    contracts.insert_pathway(two_step_pathway(
        "configure_bridge",
        "bridge_create",
        "bridge_stp",
    ));

    let engine = ScriptedEngine::new(vec![fused_source]);
    let organism = Organism::open(
        temp_root("fusion"),
        contracts,
        FakeCapability::new(),
        engine.clone(),
    )
    .unwrap();
    organism.install_seed("bridge_create", CREATE_BRIDGE).unwrap();
    organism.install_seed("bridge_stp", ENABLE_STP).unwrap();

    let input = r#"{"bridge_name": "br0"}"#;
    for run in 0..10 {
        let result = organism.run_pathway("configure_bridge", input).await.unwrap();
        assert!(result.success, "run {run} failed");
        assert!(!result.used_fused);
    }
    // The tenth identical-composition success requested fusion and the
    // scripted engine delivered a merged allele.
    assert_eq!(engine.call_count(), 1);
    let fused = organism
        .fusion()
        .state("configure_bridge")
        .unwrap()
        .fused_allele
        .expect("fused allele installed");

    let result = organism.run_pathway("configure_bridge", input).await.unwrap();
    assert!(result.used_fused);
    assert_eq!(result.composition, vec![fused.clone()]);

    // A fused failure clears the slot and the same call falls back to the
    // two-step form.
    let result = organism
        .run_pathway("configure_bridge", r#"{"bridge_name": "br0", "break_fused": true}"#)
        .await
        .unwrap();
    assert!(result.success);
    assert!(!result.used_fused);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(
        organism.fusion().state("configure_bridge").unwrap().fused_allele,
        None
    );
}

#[tokio::test]
async fn failed_configuration_gene_rolls_back_both_mutations_in_reverse() {
    let schema_invalid = r#"
use json

fn execute(input) {
    let data = json::parse(input)
    sdk.create("r1")
    sdk.create("r2")
    json::dump({ success: true })
}
"#;
    let mut contracts = ContractSet::new();
    // `gives` requires a bridge field the gene never returns.
    contracts.insert_gene(gene(
        "configure",
        GeneFamily::Configuration,
        RiskClass::Low,
        vec![field("bridge", "string")],
    ));
    let capability = FakeCapability::new();
    let organism = Organism::open(
        temp_root("rollback"),
        contracts,
        capability.clone(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap()
    .with_inverse_table(InverseTable::new().register("create", |args, _| {
        Some(UndoOp {
            operation: "delete".into(),
            args: args.to_vec(),
        })
    }));
    let seed = organism.install_seed("configure", schema_invalid).unwrap();

    let err = organism.execute_gene("configure", r#"{}"#).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);

    // Both inverses drained, most recent first; no residual state.
    assert!(capability.resources.lock().unwrap().is_empty());
    assert_eq!(
        capability.log.lock().unwrap().as_slice(),
        &["create:r1", "create:r2", "delete:r2", "delete:r1"]
    );
    let record = organism.registry().get(&seed).unwrap().unwrap();
    assert_eq!(record.fitness.invocations, 1);
    assert_eq!(record.fitness.successes, 0);
    assert!(!organism.is_dirty());
}

#[tokio::test]
async fn denied_import_fails_the_invocation_not_the_load() {
    let smuggler = r#"
use filesystem

fn execute(input) {
    input
}
"#;
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "smuggle",
        GeneFamily::Diagnostic,
        RiskClass::None,
        Vec::new(),
    ));
    let organism = Organism::open(
        temp_root("denied"),
        contracts,
        FakeCapability::new(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap();
    // Registration (and thus load-time checking) accepts the source.
    let digest = organism.install_seed("smuggle", smuggler).unwrap();

    let err = organism.execute_gene("smuggle", r#"{}"#).await.unwrap_err();
    assert!(err.to_string().contains("import denied"), "got: {err}");

    let record = organism.registry().get(&digest).unwrap().unwrap();
    assert_eq!(record.fitness.invocations, 1);
    assert_eq!(record.fitness.successes, 0);
}

#[tokio::test]
async fn unhealthy_verification_decays_convergence_fitness() {
    let mut configure = gene(
        "configure",
        GeneFamily::Configuration,
        RiskClass::Low,
        vec![field("bridge", "string")],
    );
    configure.verify = vec![VerifyStep {
        locus: "check_health".into(),
        params: BTreeMap::from([("name".to_string(), "{bridge_name}".to_string())]),
    }];
    configure.verify_within = Some("30s".into());
    let mut contracts = ContractSet::new();
    contracts.insert_gene(configure);
    contracts.insert_gene(gene(
        "check_health",
        GeneFamily::Diagnostic,
        RiskClass::None,
        vec![field("healthy", "bool")],
    ));
    contracts.insert_pathway(two_step_pathway("just_configure", "configure", "configure"));

    let scheduler = Arc::new(QueueVerifyScheduler::new());
    let organism = Organism::open(
        temp_root("verify"),
        contracts,
        FakeCapability::new(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap()
    .with_scheduler(scheduler.clone());
    let configure_digest = organism.install_seed("configure", CREATE_BRIDGE).unwrap();
    organism
        .install_seed(
            "check_health",
            r#"
use json

fn execute(input) {
    json::dump({ success: true, healthy: false })
}
"#,
        )
        .unwrap();

    let input = r#"{"bridge_name": "br0"}"#;
    for _ in 0..5 {
        let result = organism.run_pathway("just_configure", input).await.unwrap();
        assert!(result.success);
    }
    let before = organism.arena().fitness(&configure_digest).unwrap();

    let requests = scheduler.drain();
    assert!(!requests.is_empty());
    assert_eq!(requests[0].locus, "check_health");
    assert_eq!(requests[0].input, r#"{"name":"br0"}"#);
    organism.run_verification(&requests[0]).await.unwrap();

    let after = organism.arena().fitness(&configure_digest).unwrap();
    assert!(after < before, "expected decay: {before} -> {after}");
}

#[tokio::test]
async fn import_with_wrong_digest_is_an_integrity_failure() {
    let mut contracts = ContractSet::new();
    contracts.insert_gene(gene(
        "noop",
        GeneFamily::Diagnostic,
        RiskClass::None,
        Vec::new(),
    ));
    let organism = Organism::open(
        temp_root("integrity"),
        contracts,
        FakeCapability::new(),
        ScriptedEngine::new(vec![]),
    )
    .unwrap();

    let err = organism
        .import_allele("noop", ECHO_X, "deadbeef")
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Integrity(_)));
    assert_eq!(err.exit_code(), 3);
}
