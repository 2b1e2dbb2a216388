//! Rewind and undo: collect downstream responses, soft-delete them with an
//! audit trail, and recompute derived node state over the affected region.

use crate::error::EngineError;
use crate::model::{
    history_within, Deal, DealId, NodeKey, NodeStatus, Session, SupersedeReason, UserId, WhoNeeds,
};
use crate::needs;
use crate::scheduler::NextTask;
use crate::store::Store;
use serde::Serialize;
use tracing::warn;
use types::auction;
use types::seat::Seat;

/// Nodes strictly below `target` where the user holds an active response,
/// shallowest first. These are the responses a rewind invalidates.
pub fn collect_downstream(store: &Store, user: UserId, target: &NodeKey) -> Vec<NodeKey> {
    store
        .deal_node_keys(target.deal)
        .into_iter()
        .filter(|k| {
            k.history != target.history
                && history_within(&target.history, &k.history)
                && store.active_response(k, user).is_some()
        })
        .collect()
}

/// Every node whose derived state can change when responses below `target`
/// are invalidated: the target, its whole subtree, and the ancestor chain
/// back toward the root (divergence there may collapse). Depth-ordered.
pub fn collect_affected(store: &Store, deal: &Deal, target: &NodeKey) -> Vec<NodeKey> {
    let mut affected: Vec<NodeKey> = store
        .deal_node_keys(deal.id)
        .into_iter()
        .filter(|k| history_within(&target.history, &k.history))
        .collect();
    if !affected.contains(target) {
        affected.push(target.clone());
    }

    let mut current = target.clone();
    while let Some(parent) = current.parent(deal.dealer) {
        if store.node(&parent).is_none() {
            break;
        }
        affected.push(parent.clone());
        current = parent;
    }

    affected.sort_by(|a, b| {
        (a.depth(), &a.history, a.seat.idx()).cmp(&(b.depth(), &b.history, b.seat.idx()))
    });
    affected.dedup();
    affected
}

/// Fix any stored depth that has drifted from the node's history.
pub fn recompute_depth_for_deal(store: &mut Store, deal: DealId) {
    for key in store.deal_node_keys(deal) {
        let depth = key.depth();
        if let Some(node) = store.node_mut(&key) {
            if node.depth != depth {
                warn!(node = %key.label(), stored = node.depth, actual = depth, "healing node depth");
                node.depth = depth;
            }
        }
    }
}

/// Refresh a node's open/closed status from its history. A node that
/// closes also needs nobody. Returns whether the status changed.
pub fn recompute_status(store: &mut Store, key: &NodeKey) -> Result<bool, EngineError> {
    let calls = key.calls()?;
    let status = if auction::history_closed(&calls) {
        NodeStatus::Closed
    } else {
        NodeStatus::Open
    };
    let node = store.expect_node_mut(key)?;
    let changed = node.status != status;
    node.status = status;
    if status == NodeStatus::Closed {
        node.who_needs = WhoNeeds::None;
    }
    Ok(changed)
}

/// Drop edges whose target node no longer has any active response. Edges
/// out of the root are kept so the tree skeleton stays anchored. Returns
/// the number of edges removed.
pub fn cleanup_orphaned_edges(store: &mut Store, deal: DealId) -> usize {
    let mut deleted = 0;
    for edge in store.edges_for_deal(deal) {
        if edge.from.is_root() {
            continue;
        }
        if store.active_responses_at(&edge.to).is_empty()
            && store.remove_edge(&edge.from, &edge.to, edge.call)
        {
            deleted += 1;
        }
    }
    deleted
}

/// Recompute derived state for a set of nodes in dependency order:
/// divergence first (who-needs reads it), then open/closed status, then
/// who-needs, cascading to same-seat descendants of divergent nodes.
pub fn recompute_all(
    store: &mut Store,
    session: &Session,
    deal: &Deal,
    nodes: &[NodeKey],
) -> Result<(), EngineError> {
    for key in nodes {
        needs::recompute_divergence(store, key)?;
    }
    for key in nodes {
        recompute_status(store, key)?;
    }
    for key in nodes {
        needs::update_who_needs(store, session, deal, key)?;
        if store.expect_node(key)?.divergence {
            needs::update_descendants_who_needs(store, session, deal, key)?;
        }
    }
    Ok(())
}

/// Dry-run counts for a rewind, shown before the caller confirms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewindPreview {
    pub target_history: String,
    pub target_seat: Seat,
    pub target_depth: usize,
    pub responses_to_delete: usize,
    pub nodes_affected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewindOutcome {
    pub deleted_responses: usize,
    pub affected_nodes: usize,
    pub edges_deleted: usize,
    pub next_task: NextTask,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RewindReport {
    Preview(RewindPreview),
    Applied(RewindOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoOutcome {
    pub undone_call: String,
    pub undone_history: String,
    pub deal_number: u32,
    pub deleted_responses: usize,
    pub affected_nodes: usize,
    pub next_task: NextTask,
}

pub fn preview(
    store: &Store,
    deal: &Deal,
    user: UserId,
    target: &NodeKey,
) -> Result<RewindPreview, EngineError> {
    store.expect_node(target)?;
    Ok(RewindPreview {
        target_history: target.history.clone(),
        target_seat: target.seat,
        target_depth: target.depth(),
        responses_to_delete: collect_downstream(store, user, target).len(),
        nodes_affected: collect_affected(store, deal, target).len(),
    })
}

/// Perform the rewind: supersede the user's downstream responses (audited
/// with the target and each deleted position), truncate the user's
/// flattened sequence, then recompute depth, divergence, status, who-needs
/// over the affected region and drop orphaned edges.
///
/// Returns (deleted responses, affected nodes, edges deleted). The caller
/// holds the deal lock.
pub fn apply_rewind(
    store: &mut Store,
    session: &Session,
    deal: &Deal,
    user: UserId,
    target: &NodeKey,
    reason: SupersedeReason,
) -> Result<(usize, usize, usize), EngineError> {
    store.expect_node(target)?;
    let downstream = collect_downstream(store, user, target);
    let affected = collect_affected(store, deal, target);

    let mut deleted = 0;
    for key in &downstream {
        let superseded = store.supersede(
            key,
            user,
            reason,
            serde_json::json!({
                "rewind_to": target.history,
                "deleted_history": key.history,
            }),
        );
        if superseded.is_some() {
            deleted += 1;
        }
    }

    // The user's response at the target itself survives, so their
    // flattened sequence keeps the call made there too.
    let keep = if store.active_response(target, user).is_some() {
        target.depth() + 1
    } else {
        target.depth()
    };
    if let Some(sequence) = store.sequence_mut(deal.id, user) {
        sequence.entries.truncate(keep);
    }

    recompute_depth_for_deal(store, deal.id);
    recompute_all(store, session, deal, &affected)?;
    let edges_deleted = cleanup_orphaned_edges(store, deal.id);

    Ok((deleted, affected.len(), edges_deleted))
}
