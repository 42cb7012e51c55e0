//! Rule engine hook.
//!
//! Rules run after every merge that changes a record. A rule reads and
//! writes back into the store through its [`RuleContext`]; writes issued
//! through the context suppress rule evaluation on their own merge, so a
//! chain of rules fires each write at most once per original trigger
//! rather than cascading unboundedly.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::StoreResult;
use crate::record::{NodeId, NodeRecord};
use crate::store::Store;

/// A named procedure invoked after a merge.
///
/// Errors are caught and logged by the store; they never abort the merge
/// that triggered the rule.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, record: &NodeRecord, ctx: &RuleContext<'_>) -> anyhow::Result<()>;
}

/// Bounded view of the store handed to rules.
pub struct RuleContext<'a> {
    store: &'a Store,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Reads the current record for `id`.
    pub async fn get(&self, id: &str) -> StoreResult<Option<NodeRecord>> {
        self.store.read_record(id).await
    }

    /// Writes back into the store with rule evaluation suppressed for the
    /// resulting merge.
    pub async fn put(&self, id: impl Into<NodeId>, data: JsonValue) -> StoreResult<()> {
        self.store.rule_put(id.into(), data).await
    }
}
