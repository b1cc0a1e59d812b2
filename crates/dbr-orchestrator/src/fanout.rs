//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Run one action against a node set and aggregate per-node outcomes."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::allocation::NodeId;
use crate::channel::NodeError;
use crate::node::ClusterNode;

/// How per-node outcomes combine into a phase outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Any node failure fails the action.
    AllMustSucceed,
    /// Failures are reported; the action itself always succeeds.
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct NodeOutcome<T> {
    pub node: NodeId,
    pub result: Result<T, NodeError>,
}

/// Collected outcomes of one fan-out, in node order.
#[derive(Debug, Clone)]
pub struct FanOutReport<T> {
    pub action: &'static str,
    pub rule: Aggregation,
    pub outcomes: Vec<NodeOutcome<T>>,
}

impl<T> FanOutReport<T> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Verdict under the report's aggregation rule.
    pub fn is_success(&self) -> bool {
        match self.rule {
            Aggregation::AllMustSucceed => self.all_succeeded(),
            Aggregation::BestEffort => true,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (NodeId, &NodeError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|err| (o.node, err)))
    }

    pub fn first_failure(&self) -> Option<&NodeError> {
        self.failures().next().map(|(_, err)| err)
    }

    /// Successful values keyed by node.
    pub fn values(&self) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|value| (o.node, value)))
    }
}

/// Run `action` against every node with at most `concurrency` in flight.
pub async fn fan_out<'a, T, F, Fut>(
    action: &'static str,
    nodes: &'a [ClusterNode],
    concurrency: usize,
    rule: Aggregation,
    op: F,
) -> FanOutReport<T>
where
    F: Fn(&'a ClusterNode) -> Fut,
    Fut: Future<Output = Result<T, NodeError>> + 'a,
{
    let outcomes: Vec<NodeOutcome<T>> = stream::iter(nodes)
        .map(|node| {
            let pending = op(node);
            async move {
                NodeOutcome {
                    node: node.id,
                    result: pending.await,
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let report = FanOutReport {
        action,
        rule,
        outcomes,
    };
    for (node, err) in report.failures() {
        warn!(action, %node, code = %err.code(), error = %err, "fan-out action failed on node");
    }
    debug!(
        action,
        succeeded = report.succeeded(),
        failed = report.failed(),
        rule = ?rule,
        "fan-out complete"
    );
    report
}
