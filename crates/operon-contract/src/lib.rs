//! Parsed contract values: the read-only slot descriptions the runtime binds
//! alleles against. Parsing the contract text format happens outside the core;
//! this crate only defines the structured value and the per-invocation output
//! schema check.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Gene,
    Pathway,
    Topology,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GeneFamily {
    Configuration,
    Diagnostic,
}

/// Blast-radius classification driving the safety policy table.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskClass {
    pub fn requires_transaction(self) -> bool {
        self >= RiskClass::Low
    }

    pub fn requires_shadow(self) -> bool {
        self >= RiskClass::High
    }

    pub fn requires_resilience(self) -> bool {
        self == RiskClass::Critical
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Timescale {
    Immediate,
    Convergence,
    Resilience,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseType {
    String,
    Bool,
    Int,
    Float,
}

/// A field type drawn from `{string, bool, int, float}` with an optional `[]`
/// suffix for sequences and `?` for nullable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldType {
    pub base: BaseType,
    pub sequence: bool,
    pub nullable: bool,
}

impl FieldType {
    pub fn parse(spec: &str) -> Result<Self, ContractError> {
        let mut rest = spec.trim();
        let nullable = rest.ends_with('?');
        if nullable {
            rest = &rest[..rest.len() - 1];
        }
        let sequence = rest.ends_with("[]");
        if sequence {
            rest = &rest[..rest.len() - 2];
        }
        let base = match rest {
            "string" => BaseType::String,
            "bool" => BaseType::Bool,
            "int" => BaseType::Int,
            "float" => BaseType::Float,
            other => return Err(ContractError::InvalidType(other.to_string())),
        };
        Ok(Self {
            base,
            sequence,
            nullable,
        })
    }

    pub fn matches(&self, value: &Value) -> bool {
        if self.nullable && value.is_null() {
            return true;
        }
        if self.sequence {
            return match value.as_array() {
                Some(items) => items.iter().all(|item| base_matches(self.base, item)),
                None => false,
            };
        }
        base_matches(self.base, value)
    }
}

fn base_matches(base: BaseType, value: &Value) -> bool {
    match base {
        BaseType::String => value.is_string(),
        BaseType::Bool => value.is_boolean(),
        BaseType::Int => value.is_i64() || value.is_u64(),
        BaseType::Float => value.is_number(),
    }
}

impl TryFrom<String> for FieldType {
    type Error = ContractError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldType::parse(&value)
    }
}

impl From<FieldType> for String {
    fn from(ty: FieldType) -> String {
        let mut out = match ty.base {
            BaseType::String => "string".to_string(),
            BaseType::Bool => "bool".to_string(),
            BaseType::Int => "int".to_string(),
            BaseType::Float => "float".to_string(),
        };
        if ty.sequence {
            out.push_str("[]");
        }
        if ty.nullable {
            out.push('?');
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub doc: String,
}

/// A verification step: diagnostic locus plus parameter bindings resolved
/// against the triggering input with the `{name}` reference syntax.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerifyStep {
    pub locus: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedsDef {
    pub target_locus: String,
    pub timescale: Timescale,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneContract {
    pub name: String,
    pub family: GeneFamily,
    pub risk: RiskClass,
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
    #[serde(default)]
    pub gives: Vec<FieldDef>,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub fails_when: Vec<String>,
    #[serde(default)]
    pub unhealthy_when: Vec<String>,
    #[serde(default)]
    pub verify: Vec<VerifyStep>,
    /// Convergence window: how long after execution the verify diagnostics
    /// may still resolve this gene's convergence slot.
    #[serde(default)]
    pub verify_within: Option<String>,
    #[serde(default)]
    pub feeds: Vec<FeedsDef>,
    /// Per-locus override of the sandbox wall-clock limit.
    #[serde(default)]
    pub execution_timeout: Option<String>,
}

impl GeneContract {
    pub fn convergence_window(&self) -> Result<Option<Duration>, ContractError> {
        self.verify_within
            .as_deref()
            .map(parse_duration)
            .transpose()
    }

    pub fn sandbox_timeout(&self) -> Result<Option<Duration>, ContractError> {
        self.execution_timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    Locus(String),
    SubPathway(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IterationSpec {
    pub variable: String,
    /// Binding-DSL expression evaluating to a sequence.
    pub expr: String,
}

/// `when step N.field = literal`: the step runs only if the guard holds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GuardSpec {
    pub step: usize,
    pub field: String,
    pub equals: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PathwayStep {
    pub index: usize,
    pub name: String,
    pub target: StepTarget,
    /// Parameter name → binding-DSL expression.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub iterate: Option<IterationSpec>,
    #[serde(default)]
    pub guard: Option<GuardSpec>,
    #[serde(default)]
    pub needs: BTreeSet<usize>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    RollbackAll,
    ReportPartial,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathwayContract {
    pub name: String,
    pub risk: RiskClass,
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
    pub steps: Vec<PathwayStep>,
    #[serde(default)]
    pub verify: Vec<VerifyStep>,
    #[serde(default)]
    pub verify_within: Option<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// Topology contracts parse but carry no execution semantics in the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyContract {
    pub name: String,
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
}

/// The set of parsed contracts the runtime was opened with.
#[derive(Clone, Debug, Default)]
pub struct ContractSet {
    genes: BTreeMap<String, GeneContract>,
    pathways: BTreeMap<String, PathwayContract>,
    topologies: BTreeMap<String, TopologyContract>,
}

impl ContractSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_gene(&mut self, contract: GeneContract) {
        self.genes.insert(contract.name.clone(), contract);
    }

    pub fn insert_pathway(&mut self, contract: PathwayContract) {
        self.pathways.insert(contract.name.clone(), contract);
    }

    pub fn insert_topology(&mut self, contract: TopologyContract) {
        self.topologies.insert(contract.name.clone(), contract);
    }

    pub fn gene(&self, locus: &str) -> Option<&GeneContract> {
        self.genes.get(locus)
    }

    pub fn pathway(&self, name: &str) -> Option<&PathwayContract> {
        self.pathways.get(name)
    }

    pub fn known_loci(&self) -> impl Iterator<Item = &str> {
        self.genes.keys().map(String::as_str)
    }

    pub fn known_pathways(&self) -> impl Iterator<Item = &str> {
        self.pathways.keys().map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invalid field type: {0}")]
    InvalidType(String),
    #[error("unrecognized duration: {0}")]
    InvalidDuration(String),
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("output for locus '{locus}' violates contract: {reason}")]
pub struct SchemaViolation {
    pub locus: String,
    pub reason: String,
}

/// Validate a gene invocation's output against the locus's `gives` schema.
///
/// Output must be a JSON object with a boolean `success` field. When
/// `success` is true, every non-optional `gives` field must be present and
/// type-correct; optional fields are type-checked only when present.
pub fn validate_output(contract: &GeneContract, output: &str) -> Result<Value, SchemaViolation> {
    let violation = |reason: String| SchemaViolation {
        locus: contract.name.clone(),
        reason,
    };

    let value: Value = serde_json::from_str(output)
        .map_err(|err| violation(format!("output is not valid JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| violation("output is not a JSON object".into()))?;

    let success = object
        .get("success")
        .ok_or_else(|| violation("output missing 'success' field".into()))?
        .as_bool()
        .ok_or_else(|| violation("'success' field is not a boolean".into()))?;

    if success {
        for field in &contract.gives {
            if field.name == "success" {
                continue;
            }
            match object.get(&field.name) {
                Some(found) => {
                    if !field.ty.matches(found) {
                        return Err(violation(format!(
                            "field '{}' does not match type {}",
                            field.name,
                            String::from(field.ty)
                        )));
                    }
                }
                None if field.optional => {}
                None => {
                    return Err(violation(format!(
                        "required output field '{}' missing",
                        field.name
                    )));
                }
            }
        }
    }

    Ok(value)
}

/// Parse a duration string: `"30s"`, `"5m"`, `"1h"`.
pub fn parse_duration(spec: &str) -> Result<Duration, ContractError> {
    let spec = spec.trim();
    let (digits, multiplier) = if let Some(rest) = spec.strip_suffix('s') {
        (rest, 1.0)
    } else if let Some(rest) = spec.strip_suffix('m') {
        (rest, 60.0)
    } else if let Some(rest) = spec.strip_suffix('h') {
        (rest, 3600.0)
    } else {
        return Err(ContractError::InvalidDuration(spec.to_string()));
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| ContractError::InvalidDuration(spec.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ContractError::InvalidDuration(spec.to_string()));
    }
    Ok(Duration::from_secs_f64(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_contract() -> GeneContract {
        GeneContract {
            name: "noop".into(),
            family: GeneFamily::Diagnostic,
            risk: RiskClass::None,
            does: "echoes its input".into(),
            takes: vec![FieldDef {
                name: "x".into(),
                ty: FieldType::parse("int").unwrap(),
                optional: false,
                default: None,
                doc: String::new(),
            }],
            gives: vec![
                FieldDef {
                    name: "x".into(),
                    ty: FieldType::parse("int").unwrap(),
                    optional: false,
                    default: None,
                    doc: String::new(),
                },
                FieldDef {
                    name: "note".into(),
                    ty: FieldType::parse("string").unwrap(),
                    optional: true,
                    default: None,
                    doc: String::new(),
                },
            ],
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

    #[test]
    fn field_type_round_trips() {
        for spec in ["string", "bool", "int[]", "float?", "string[]?"] {
            let ty = FieldType::parse(spec).unwrap();
            assert_eq!(String::from(ty), spec);
        }
        assert!(FieldType::parse("blob").is_err());
    }

    #[test]
    fn type_matching_distinguishes_int_and_float() {
        let int_ty = FieldType::parse("int").unwrap();
        let float_ty = FieldType::parse("float").unwrap();
        assert!(int_ty.matches(&json!(3)));
        assert!(!int_ty.matches(&json!(3.5)));
        assert!(float_ty.matches(&json!(3)));
        assert!(float_ty.matches(&json!(3.5)));
        assert!(!int_ty.matches(&json!(true)));
    }

    #[test]
    fn validate_output_accepts_conforming_success() {
        let contract = echo_contract();
        let value =
            validate_output(&contract, r#"{"success": true, "x": 1}"#).unwrap();
        assert_eq!(value["x"], json!(1));
    }

    #[test]
    fn validate_output_rejects_missing_required_field() {
        let contract = echo_contract();
        let err = validate_output(&contract, r#"{"success": true}"#).unwrap_err();
        assert!(err.reason.contains("'x'"));
    }

    #[test]
    fn validate_output_skips_gives_check_on_failure() {
        let contract = echo_contract();
        let value =
            validate_output(&contract, r#"{"success": false, "error": "nope"}"#).unwrap();
        assert_eq!(value["success"], json!(false));
    }

    #[test]
    fn validate_output_rejects_wrong_type() {
        let contract = echo_contract();
        let err =
            validate_output(&contract, r#"{"success": true, "x": "one"}"#).unwrap_err();
        assert!(err.reason.contains("does not match type"));
    }

    #[test]
    fn durations_parse_with_unit_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn risk_policy_thresholds() {
        assert!(!RiskClass::None.requires_transaction());
        assert!(RiskClass::Low.requires_transaction());
        assert!(!RiskClass::Medium.requires_shadow());
        assert!(RiskClass::High.requires_shadow());
        assert!(RiskClass::Critical.requires_resilience());
        assert!(!RiskClass::High.requires_resilience());
    }
}
