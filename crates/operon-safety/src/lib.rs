//! Transactional safety for configuration genes. Mutating capability calls
//! are paired with inverses through a registration table supplied at startup;
//! a failed invocation drains the undo log in reverse, attempting every
//! inverse even when some of them fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use operon_sandbox::{Capability, CapabilityFault};

/// Consecutive mock-capability successes required before a shadow allele
/// advances to canary, and live canary successes before recessive.
#[derive(Clone, Copy, Debug)]
pub struct SafetyConfig {
    pub shadow_qualification_runs: u32,
    pub canary_qualification_runs: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            shadow_qualification_runs: 3,
            canary_qualification_runs: 3,
        }
    }
}

/// A replayable inverse: one capability operation with fixed arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct UndoOp {
    pub operation: String,
    pub args: Vec<Value>,
}

#[derive(Clone, Debug)]
struct UndoAction {
    description: String,
    op: UndoOp,
}

/// Builds the inverse of a successful mutating call from its arguments and
/// result. Returning `None` records nothing (the call turned out to be a
/// no-op).
pub type InverseBuilder = Arc<dyn Fn(&[Value], &Value) -> Option<UndoOp> + Send + Sync>;

/// Registration table: capability operation name → inverse builder. Only
/// registered operations are treated as mutating.
#[derive(Clone, Default)]
pub struct InverseTable {
    entries: HashMap<String, InverseBuilder>,
}

impl InverseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        operation: impl Into<String>,
        builder: impl Fn(&[Value], &Value) -> Option<UndoOp> + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(operation.into(), Arc::new(builder));
        self
    }

    pub fn get(&self, operation: &str) -> Option<&InverseBuilder> {
        self.entries.get(operation)
    }

    pub fn is_mutating(&self, operation: &str) -> bool {
        self.entries.contains_key(operation)
    }
}

/// Outcome of draining an undo log. `failures` being non-empty means the
/// environment may be dirty; the caller surfaces that as an incomplete
/// transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackReport {
    pub rolled_back: Vec<String>,
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Debug, Error)]
pub enum SafetyError {
    #[error("transaction rollback incomplete for locus '{locus}': {failures:?}")]
    TransactionIncomplete {
        locus: String,
        failures: Vec<String>,
    },
}

/// Per-invocation undo log. Created before a configuration gene executes;
/// committed on success, drained in reverse on failure.
pub struct Transaction {
    locus: String,
    undo_log: Vec<UndoAction>,
    committed: bool,
    rolled_back: bool,
}

impl Transaction {
    pub fn new(locus: impl Into<String>) -> Self {
        Self {
            locus: locus.into(),
            undo_log: Vec::new(),
            committed: false,
            rolled_back: false,
        }
    }

    pub fn locus(&self) -> &str {
        &self.locus
    }

    pub fn record(&mut self, description: impl Into<String>, op: UndoOp) {
        self.undo_log.push(UndoAction {
            description: description.into(),
            op,
        });
    }

    pub fn action_count(&self) -> usize {
        self.undo_log.len()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Discard the undo log; the invocation's effects stand.
    pub fn commit(&mut self) {
        self.committed = true;
        self.undo_log.clear();
    }

    /// Drain the undo log in reverse against the raw (unwrapped) capability.
    /// Individual inverse failures are recorded and the drain continues.
    pub fn rollback(&mut self, capability: &dyn Capability) -> RollbackReport {
        let mut report = RollbackReport::default();
        while let Some(action) = self.undo_log.pop() {
            match capability.call(&action.op.operation, &action.op.args) {
                Ok(_) => {
                    debug!(locus = %self.locus, action = %action.description, "rolled back");
                    report.rolled_back.push(action.description);
                }
                Err(err) => {
                    warn!(
                        locus = %self.locus,
                        action = %action.description,
                        error = %err,
                        "rollback step failed"
                    );
                    report
                        .failures
                        .push(format!("{}: {err}", action.description));
                }
            }
        }
        self.rolled_back = true;
        report
    }

    pub fn incomplete_error(&self, report: &RollbackReport) -> Option<SafetyError> {
        if report.is_clean() {
            None
        } else {
            Some(SafetyError::TransactionIncomplete {
                locus: self.locus.clone(),
                failures: report.failures.clone(),
            })
        }
    }
}

/// Thin wrapped capability that records inverses as mutating calls succeed.
/// Non-mutating operations pass through untouched.
pub struct TransactionalCapability {
    inner: Arc<dyn Capability>,
    table: Arc<InverseTable>,
    transaction: Arc<Mutex<Transaction>>,
}

impl TransactionalCapability {
    pub fn new(
        inner: Arc<dyn Capability>,
        table: Arc<InverseTable>,
        transaction: Arc<Mutex<Transaction>>,
    ) -> Self {
        Self {
            inner,
            table,
            transaction,
        }
    }
}

impl Capability for TransactionalCapability {
    fn call(&self, operation: &str, args: &[Value]) -> Result<Value, CapabilityFault> {
        let result = self.inner.call(operation, args)?;
        if let Some(builder) = self.table.get(operation) {
            if let Some(undo) = builder(args, &result) {
                let mut transaction = self
                    .transaction
                    .lock()
                    .map_err(|_| CapabilityFault::Failed("transaction lock poisoned".into()))?;
                transaction.record(format!("undo {operation}"), undo);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// In-memory capability tracking named resources, with optional
    /// injected failure for a single operation.
    struct FakeCapability {
        resources: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
        log: Mutex<Vec<String>>,
    }

    impl FakeCapability {
        fn new() -> Self {
            Self {
                resources: Mutex::new(Vec::new()),
                fail_on: Mutex::new(None),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    impl Capability for FakeCapability {
        fn call(&self, operation: &str, args: &[Value]) -> Result<Value, CapabilityFault> {
            self.log.lock().unwrap().push(operation.to_string());
            if self.fail_on.lock().unwrap().as_deref() == Some(operation) {
                return Err(CapabilityFault::Failed("injected".into()));
            }
            let name = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match operation {
                "create" => {
                    self.resources.lock().unwrap().push(name);
                    Ok(json!({ "created": true }))
                }
                "delete" => {
                    self.resources.lock().unwrap().retain(|existing| existing != &name);
                    Ok(json!({ "deleted": true }))
                }
                other => Err(CapabilityFault::Failed(format!("unknown op {other}"))),
            }
        }
    }

    fn delete_inverse() -> InverseTable {
        InverseTable::new().register("create", |args, _result| {
            Some(UndoOp {
                operation: "delete".into(),
                args: args.to_vec(),
            })
        })
    }

    #[test]
    fn commit_discards_the_undo_log() {
        let mut transaction = Transaction::new("configure");
        transaction.record(
            "undo create",
            UndoOp {
                operation: "delete".into(),
                args: vec![json!("br0")],
            },
        );
        transaction.commit();
        assert!(transaction.is_committed());
        assert_eq!(transaction.action_count(), 0);
    }

    #[test]
    fn wrapped_capability_records_inverses_for_mutating_calls() {
        let inner = Arc::new(FakeCapability::new());
        let transaction = Arc::new(Mutex::new(Transaction::new("configure")));
        let wrapped = TransactionalCapability::new(
            inner.clone(),
            Arc::new(delete_inverse()),
            transaction.clone(),
        );

        wrapped.call("create", &[json!("br0")]).unwrap();
        wrapped.call("create", &[json!("br1")]).unwrap();
        assert_eq!(transaction.lock().unwrap().action_count(), 2);
        assert_eq!(inner.resources.lock().unwrap().len(), 2);
    }

    #[test]
    fn rollback_drains_in_reverse_order() {
        let inner = Arc::new(FakeCapability::new());
        let transaction = Arc::new(Mutex::new(Transaction::new("configure")));
        let wrapped = TransactionalCapability::new(
            inner.clone(),
            Arc::new(delete_inverse()),
            transaction.clone(),
        );

        wrapped.call("create", &[json!("br0")]).unwrap();
        wrapped.call("create", &[json!("br1")]).unwrap();

        let report = transaction.lock().unwrap().rollback(inner.as_ref());
        assert!(report.is_clean());
        assert!(inner.resources.lock().unwrap().is_empty());
        let log = inner.log.lock().unwrap();
        // create br0, create br1, then deletes in reverse: br1 first.
        assert_eq!(log.as_slice(), &["create", "create", "delete", "delete"]);
    }

    #[test]
    fn rollback_continues_past_individual_failures() {
        let inner = Arc::new(FakeCapability::new());
        let transaction = Arc::new(Mutex::new(Transaction::new("configure")));
        let wrapped = TransactionalCapability::new(
            inner.clone(),
            Arc::new(delete_inverse()),
            transaction.clone(),
        );

        wrapped.call("create", &[json!("br0")]).unwrap();
        wrapped.call("create", &[json!("br1")]).unwrap();
        *inner.fail_on.lock().unwrap() = Some("delete".into());

        let mut transaction = transaction.lock().unwrap();
        let report = transaction.rollback(inner.as_ref());
        assert_eq!(report.failures.len(), 2);
        assert!(transaction.is_rolled_back());
        assert!(matches!(
            transaction.incomplete_error(&report),
            Some(SafetyError::TransactionIncomplete { .. })
        ));
    }

    #[test]
    fn non_mutating_calls_record_nothing() {
        let inner = Arc::new(FakeCapability::new());
        let transaction = Arc::new(Mutex::new(Transaction::new("probe")));
        let wrapped = TransactionalCapability::new(
            inner.clone(),
            Arc::new(InverseTable::new()),
            transaction.clone(),
        );
        wrapped.call("create", &[json!("br0")]).unwrap();
        assert_eq!(transaction.lock().unwrap().action_count(), 0);
    }
}
