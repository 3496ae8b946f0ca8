//! Mutation orchestration. When a locus exhausts its stack or regresses, the
//! driver assembles a prompt document, calls the external engine, verifies
//! the returned source exposes an `execute` entry point, and installs the new
//! allele per the risk policy. The engine itself is opaque; nothing is
//! persisted when it fails.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use operon_contract::RiskClass;
use operon_phenotype::{PhenotypeError, PhenotypeMap};
use operon_registry::{
    digest_source, AlleleState, Digest, NewAllele, Registry, RegistryError,
};
use operon_sandbox::CompiledGene;

pub const MAX_GENERATION_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationTrigger {
    Exhausted,
    Regression,
    Fusion,
    Proactive,
}

/// Everything the external engine gets to see. The core imposes no format on
/// how an engine renders this into an actual prompt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromptDocument {
    #[serde(default)]
    pub locus: Option<String>,
    #[serde(default)]
    pub pathway: Option<String>,
    #[serde(default)]
    pub contract_text: String,
    #[serde(default)]
    pub failing_source: Option<String>,
    #[serde(default)]
    pub failing_input: Option<String>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
    /// Constituent sources, in step order, for fusion requests.
    #[serde(default)]
    pub constituent_sources: Vec<String>,
}

#[derive(Clone, Debug, Error)]
pub enum EngineFailure {
    #[error("mutation engine failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait MutationEngine: Send + Sync {
    async fn generate(&self, prompt: &PromptDocument) -> Result<String, EngineFailure>;
}

/// Serves fixture files as mutation results: `<locus>_fix.src` for locus
/// mutations, `<pathway>_fused.src` for fusion requests.
pub struct FixtureMutationEngine {
    fixtures_dir: PathBuf,
}

impl FixtureMutationEngine {
    pub fn new<P: Into<PathBuf>>(fixtures_dir: P) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
        }
    }
}

#[async_trait]
impl MutationEngine for FixtureMutationEngine {
    async fn generate(&self, prompt: &PromptDocument) -> Result<String, EngineFailure> {
        let name = match (&prompt.pathway, &prompt.locus) {
            (Some(pathway), _) => format!("{pathway}_fused.src"),
            (None, Some(locus)) => format!("{locus}_fix.src"),
            (None, None) => {
                return Err(EngineFailure::Failed(
                    "prompt names neither locus nor pathway".into(),
                ))
            }
        };
        let path = self.fixtures_dir.join(&name);
        fs::read_to_string(&path)
            .map_err(|_| EngineFailure::Failed(format!("no fixture at {}", path.display())))
    }
}

#[derive(Clone, Debug)]
pub struct MutationRequest {
    pub locus: String,
    pub trigger: MutationTrigger,
    pub risk: RiskClass,
    pub parent: Option<Digest>,
    pub prompt: PromptDocument,
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutation engine produced nothing usable after {attempts} attempt(s): {last_error}")]
    EngineFailure { attempts: u32, last_error: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Phenotype(#[from] PhenotypeError),
}

pub struct MutationDriver {
    registry: Arc<Registry>,
    phenotype: Arc<PhenotypeMap>,
    engine: Arc<dyn MutationEngine>,
    max_attempts: u32,
}

impl MutationDriver {
    pub fn new(
        registry: Arc<Registry>,
        phenotype: Arc<PhenotypeMap>,
        engine: Arc<dyn MutationEngine>,
    ) -> Self {
        Self {
            registry,
            phenotype,
            engine,
            max_attempts: MAX_GENERATION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Obtain a new allele for a locus and install it into the fallback
    /// stack, at shadow (risk ≥ high) or recessive.
    pub async fn mutate(&self, request: &MutationRequest) -> Result<Digest, MutationError> {
        let source = self.generate_checked(&request.prompt).await?;
        let state = if request.risk.requires_shadow() {
            AlleleState::Shadow
        } else {
            AlleleState::Recessive
        };
        let digest = self.registry.put(
            &source,
            NewAllele {
                locus: request.locus.clone(),
                parent: request.parent.clone(),
                mutation_ctx: mutation_context(request.trigger, &request.prompt),
                state,
            },
        )?;
        // Shadow alleles stay out of the live stack until they qualify
        // against the mock capability.
        if state == AlleleState::Recessive {
            self.phenotype.add_fallback(&request.locus, &digest)?;
        }
        info!(
            locus = %request.locus,
            %digest,
            trigger = ?request.trigger,
            ?state,
            "installed mutated allele"
        );
        Ok(digest)
    }

    /// Fulfil a fusion request: synthesize one allele replacing the given
    /// composition. The caller installs the result as the pathway's fused
    /// allele; the mutation context records the exact composition replaced.
    pub async fn synthesize_fused(
        &self,
        pathway: &str,
        composition: &[Digest],
        prompt: &PromptDocument,
    ) -> Result<Digest, MutationError> {
        let source = self.generate_checked(prompt).await?;
        let mut ctx = mutation_context(MutationTrigger::Fusion, prompt);
        ctx.insert("replaces_composition".into(), composition.join(","));
        let digest = self.registry.put(
            &source,
            NewAllele {
                locus: pathway.to_string(),
                parent: None,
                mutation_ctx: ctx,
                state: AlleleState::Recessive,
            },
        )?;
        info!(pathway, %digest, "synthesized fused allele");
        Ok(digest)
    }

    async fn generate_checked(&self, prompt: &PromptDocument) -> Result<String, MutationError> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let source = match self.engine.generate(prompt).await {
                Ok(source) => source,
                Err(err) => {
                    warn!(attempt, error = %err, "mutation generation failed");
                    last_error = err.to_string();
                    continue;
                }
            };
            match CompiledGene::compile(&source) {
                Ok(_) => return Ok(source),
                Err(err) => {
                    warn!(attempt, error = %err, "generated source rejected at load");
                    last_error = err.to_string();
                }
            }
        }
        Err(MutationError::EngineFailure {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

fn mutation_context(
    trigger: MutationTrigger,
    prompt: &PromptDocument,
) -> BTreeMap<String, String> {
    let mut ctx = BTreeMap::new();
    ctx.insert(
        "trigger".into(),
        match trigger {
            MutationTrigger::Exhausted => "exhausted",
            MutationTrigger::Regression => "regression",
            MutationTrigger::Fusion => "fusion",
            MutationTrigger::Proactive => "proactive",
        }
        .into(),
    );
    if let Some(input) = &prompt.failing_input {
        ctx.insert("failing_input_digest".into(), digest_source(input));
    }
    if let Some(error) = &prompt.error_summary {
        ctx.insert("error".into(), error.clone());
    }
    if !prompt.diagnostics.is_empty() {
        ctx.insert("diagnostics".into(), prompt.diagnostics.join("; "));
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedEngine {
        responses: Mutex<Vec<Result<String, EngineFailure>>>,
    }

    impl ScriptedEngine {
        fn new(responses: Vec<Result<String, EngineFailure>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl MutationEngine for ScriptedEngine {
        async fn generate(&self, _prompt: &PromptDocument) -> Result<String, EngineFailure> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(EngineFailure::Failed("script exhausted".into()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn fixture(name: &str) -> (Arc<Registry>, Arc<PhenotypeMap>) {
        let root = std::env::temp_dir().join(format!(
            "operon-mutation-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let registry = Arc::new(Registry::open(root.join("registry")).unwrap());
        let phenotype = Arc::new(PhenotypeMap::open(root.join("phenotype.toml")).unwrap());
        (registry, phenotype)
    }

    const VALID_GENE: &str = "fn execute(input) { input }\n";

    fn request(risk: RiskClass) -> MutationRequest {
        MutationRequest {
            locus: "configure".into(),
            trigger: MutationTrigger::Exhausted,
            risk,
            parent: None,
            prompt: PromptDocument {
                locus: Some("configure".into()),
                failing_input: Some(r#"{"x":1}"#.into()),
                error_summary: Some("all alleles exhausted".into()),
                ..PromptDocument::default()
            },
        }
    }

    #[tokio::test]
    async fn successful_generation_installs_recessive() {
        let (registry, phenotype) = fixture("install");
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(VALID_GENE.into())]));
        let driver = MutationDriver::new(registry.clone(), phenotype.clone(), engine);

        let digest = driver.mutate(&request(RiskClass::Low)).await.unwrap();
        let record = registry.get(&digest).unwrap().unwrap();
        assert_eq!(record.state, AlleleState::Recessive);
        assert_eq!(record.mutation_ctx.get("trigger").unwrap(), "exhausted");
        assert!(record.mutation_ctx.contains_key("failing_input_digest"));
        assert!(phenotype
            .resolve_with_stack("configure")
            .unwrap()
            .contains(&digest));
    }

    #[tokio::test]
    async fn high_risk_mutants_start_in_shadow() {
        let (registry, phenotype) = fixture("shadow");
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(VALID_GENE.into())]));
        let driver = MutationDriver::new(registry.clone(), phenotype, engine);

        let digest = driver.mutate(&request(RiskClass::High)).await.unwrap();
        assert_eq!(
            registry.get(&digest).unwrap().unwrap().state,
            AlleleState::Shadow
        );
    }

    #[tokio::test]
    async fn source_without_entry_point_is_retried_then_rejected() {
        let (registry, phenotype) = fixture("no-entry");
        let engine = Arc::new(ScriptedEngine::new(vec![
            Ok("fn helper(x) { x }".into()),
            Ok("fn helper(x) { x }".into()),
            Ok("fn helper(x) { x }".into()),
        ]));
        let driver = MutationDriver::new(registry.clone(), phenotype, engine);

        let err = driver.mutate(&request(RiskClass::Low)).await.unwrap_err();
        assert!(matches!(err, MutationError::EngineFailure { attempts: 3, .. }));
        assert!(registry.list("configure").unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_then_success_recovers() {
        let (registry, phenotype) = fixture("retry");
        let engine = Arc::new(ScriptedEngine::new(vec![
            Err(EngineFailure::Failed("transient".into())),
            Ok(VALID_GENE.into()),
        ]));
        let driver = MutationDriver::new(registry, phenotype, engine);
        assert!(driver.mutate(&request(RiskClass::Low)).await.is_ok());
    }

    #[tokio::test]
    async fn fused_allele_records_replaced_composition() {
        let (registry, phenotype) = fixture("fused");
        let engine = Arc::new(ScriptedEngine::new(vec![Ok(VALID_GENE.into())]));
        let driver = MutationDriver::new(registry.clone(), phenotype, engine);

        let composition = vec!["aaa".to_string(), "bbb".to_string()];
        let digest = driver
            .synthesize_fused(
                "configure_bridge",
                &composition,
                &PromptDocument {
                    pathway: Some("configure_bridge".into()),
                    constituent_sources: vec!["s1".into(), "s2".into()],
                    ..PromptDocument::default()
                },
            )
            .await
            .unwrap();
        let record = registry.get(&digest).unwrap().unwrap();
        assert_eq!(
            record.mutation_ctx.get("replaces_composition").unwrap(),
            "aaa,bbb"
        );
    }

    #[tokio::test]
    async fn fixture_engine_resolves_by_naming_convention() {
        let dir = std::env::temp_dir().join(format!(
            "operon-mutation-fixtures-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("configure_fix.src"), VALID_GENE).unwrap();
        let engine = FixtureMutationEngine::new(&dir);

        let prompt = PromptDocument {
            locus: Some("configure".into()),
            ..PromptDocument::default()
        };
        assert_eq!(engine.generate(&prompt).await.unwrap(), VALID_GENE);

        let missing = PromptDocument {
            locus: Some("absent".into()),
            ..PromptDocument::default()
        };
        assert!(engine.generate(&missing).await.is_err());
    }
}
