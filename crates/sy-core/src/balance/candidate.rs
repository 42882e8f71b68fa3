//! Per-tier candidate selection from probe histories.

use crate::adapter::{Outbound, OutboundRegistry};
use crate::history::HistoryStore;
use std::sync::Arc;
use std::time::Duration;

/// Health observation for one tag at selection time.
#[derive(Debug, Clone)]
pub(crate) struct NodeStat {
    pub tag: String,
    pub delay: u16,
    pub failed: bool,
}

/// Sample each tag's latest history once. A tag with no history, or with a
/// history older than `stale_after`, counts as failed. Tags missing from
/// the registry are dropped.
pub(crate) fn collect_tier_stats(
    tags: &[String],
    history: &HistoryStore,
    registry: &OutboundRegistry,
    stale_after: Duration,
) -> Vec<NodeStat> {
    let mut stats = Vec::with_capacity(tags.len());
    for tag in tags {
        if registry.lookup(tag).is_none() {
            continue;
        }
        match history.load(tag) {
            Some(entry) if entry.time.elapsed() <= stale_after => stats.push(NodeStat {
                tag: tag.clone(),
                delay: entry.delay,
                failed: false,
            }),
            _ => stats.push(NodeStat {
                tag: tag.clone(),
                delay: 0,
                failed: true,
            }),
        }
    }
    stats
}

/// The `top_n` healthiest nodes, ascending by delay with the tag as a
/// stable tie-break, resolved to their outbound handles. Tags that no
/// longer resolve are silently dropped. Empty output is legal.
pub(crate) fn select_top_n(
    stats: &[NodeStat],
    top_n: usize,
    registry: &OutboundRegistry,
) -> Vec<Arc<dyn Outbound>> {
    let mut healthy: Vec<&NodeStat> = stats.iter().filter(|s| !s.failed).collect();
    healthy.sort_by(|a, b| a.delay.cmp(&b.delay).then_with(|| a.tag.cmp(&b.tag)));
    healthy
        .iter()
        .take(top_n)
        .filter_map(|s| registry.lookup(&s.tag))
        .collect()
}
