//! Shared auction tree: node identity, idempotent node creation, and the
//! breadth-first rebuild that derives edges and divergence from active
//! responses.

use crate::error::EngineError;
use crate::model::{
    Deal, DealId, Edge, Node, NodeKey, NodeStatus, PartnerRole, RoleSet, WhoNeeds,
};
use crate::needs;
use crate::store::Store;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::warn;
use types::auction;
use types::call::Call;
use types::seat::{Seat, Vulnerability};

/// Look up or create the node for a call-history prefix. The history is
/// normalized (aliases collapsed, whitespace canonicalized) before keying,
/// and the seat is derived from the dealer, so the same position always
/// maps to the same node no matter who reaches it first.
///
/// Existing nodes are healed in place: derived fields that have drifted
/// from the history (depth, open/closed status) are recomputed.
pub fn get_or_create_node(
    store: &mut Store,
    deal: &Deal,
    history: &str,
) -> Result<NodeKey, EngineError> {
    let calls = auction::parse_history(history)?;
    let history = auction::render_history(&calls);
    let depth = calls.len();
    let seat = Seat::at_depth(deal.dealer, depth);
    let key = NodeKey::new(deal.id, history, seat);
    let closed = auction::history_closed(&calls);
    let status = if closed {
        NodeStatus::Closed
    } else {
        NodeStatus::Open
    };

    if let Some(node) = store.node_mut(&key) {
        if node.depth != depth {
            warn!(node = %key.label(), stored = node.depth, actual = depth, "healing node depth");
            node.depth = depth;
        }
        if node.status != status {
            warn!(node = %key.label(), "healing node status");
            node.status = status;
        }
        if closed && node.who_needs != WhoNeeds::None {
            node.who_needs = WhoNeeds::None;
        }
        return Ok(key);
    }

    store.insert_node(Node {
        key: key.clone(),
        depth,
        divergence: false,
        status,
        who_needs: if closed { WhoNeeds::None } else { WhoNeeds::Both },
    });
    Ok(key)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseView {
    pub role: PartnerRole,
    pub call: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub history: String,
    pub seat: Seat,
    pub depth: usize,
    pub divergence: bool,
    pub status: NodeStatus,
    pub who_needs: WhoNeeds,
    pub responses: Vec<ResponseView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeView {
    pub from: String,
    pub to: String,
    pub call: String,
    pub by: Vec<PartnerRole>,
}

/// Read-only projection of a deal's tree, keyed by node label. Includes
/// every stored node, reachable from the root or not.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub deal: DealId,
    pub number: u32,
    pub dealer: Seat,
    pub vulnerability: Vulnerability,
    pub root: String,
    pub nodes: BTreeMap<String, NodeView>,
    pub edges: Vec<EdgeView>,
}

/// Rebuild the deal's tree from its active responses: heal stored nodes,
/// walk breadth-first from the root, regroup responses into edges
/// (dropping stored edges the responses no longer support), refresh
/// divergence flags, then recompute who-needs for every node. Idempotent;
/// safe to run at any time.
pub fn build_tree(store: &mut Store, deal_id: DealId) -> Result<TreeSnapshot, EngineError> {
    let deal = store.deal(deal_id)?;
    let session = store.session(deal.session)?;

    for key in store.deal_node_keys(deal.id) {
        get_or_create_node(store, &deal, &key.history)?;
    }
    let root = get_or_create_node(store, &deal, "")?;

    let mut visited: HashSet<NodeKey> = HashSet::new();
    let mut produced: HashSet<(NodeKey, NodeKey, Call)> = HashSet::new();
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(key) = queue.pop_front() {
        if !visited.insert(key.clone()) {
            continue;
        }
        if store.expect_node(&key)?.status == NodeStatus::Closed {
            continue;
        }

        let mut groups: BTreeMap<Call, RoleSet> = BTreeMap::new();
        for response in store.active_responses_at(&key) {
            if let Some(role) = session.role_of(response.user) {
                groups.entry(response.call).or_default().insert(role);
            }
        }
        store.expect_node_mut(&key)?.divergence = groups.len() >= 2;

        for (call, by) in groups {
            let child_key = key.child(call);
            let child = get_or_create_node(store, &deal, &child_key.history)?;
            store.upsert_edge(Edge {
                from: key.clone(),
                to: child.clone(),
                call,
                by,
            });
            produced.insert((key.clone(), child.clone(), call));
            queue.push_back(child);
        }
    }

    // Edges are derived from active responses; a revised call leaves a
    // stale one behind, so drop anything the walk did not regenerate.
    for edge in store.edges_for_deal(deal.id) {
        if !produced.contains(&(edge.from.clone(), edge.to.clone(), edge.call)) {
            store.remove_edge(&edge.from, &edge.to, edge.call);
        }
    }

    for key in store.deal_node_keys(deal.id) {
        needs::update_who_needs(store, &session, &deal, &key)?;
    }

    snapshot(store, &deal)
}

/// Project the stored tree without mutating it.
pub fn snapshot(store: &Store, deal: &Deal) -> Result<TreeSnapshot, EngineError> {
    let session = store.session(deal.session)?;
    let mut nodes = BTreeMap::new();
    for key in store.deal_node_keys(deal.id) {
        let node = store.expect_node(&key)?;
        let mut responses: Vec<ResponseView> = store
            .active_responses_at(&key)
            .iter()
            .filter_map(|r| {
                session.role_of(r.user).map(|role| ResponseView {
                    role,
                    call: r.call.render(),
                })
            })
            .collect();
        responses.sort_by_key(|r| r.role);
        nodes.insert(
            key.label(),
            NodeView {
                history: key.history.clone(),
                seat: key.seat,
                depth: node.depth,
                divergence: node.divergence,
                status: node.status,
                who_needs: node.who_needs,
                responses,
            },
        );
    }

    let mut edges: Vec<EdgeView> = store
        .edges_for_deal(deal.id)
        .iter()
        .map(|e| EdgeView {
            from: e.from.label(),
            to: e.to.label(),
            call: e.call.render(),
            by: e.by.roles(),
        })
        .collect();
    edges.sort_by(|a, b| (&a.from, &a.to, &a.call).cmp(&(&b.from, &b.to, &b.call)));

    Ok(TreeSnapshot {
        deal: deal.id,
        number: deal.number,
        dealer: deal.dealer,
        vulnerability: deal.vulnerability,
        root: NodeKey::root(deal.id, deal.dealer).label(),
        nodes,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Session, SessionId, UserId};
    use crate::store::Store;

    const CREATOR: UserId = UserId(10);
    const PARTNER: UserId = UserId(20);

    fn seeded() -> (Store, Deal) {
        let mut store = Store::new();
        store.put_session(Session {
            id: SessionId(1),
            creator: CREATOR,
            partner: PARTNER,
        });
        let deal = Deal {
            id: DealId(1),
            session: SessionId(1),
            number: 1,
            dealer: Seat::West,
            vulnerability: Vulnerability::None,
        };
        store.put_deal(deal).unwrap();
        (store, deal)
    }

    #[test]
    fn test_get_or_create_normalizes_history() {
        let (mut store, deal) = seeded();
        let a = get_or_create_node(&mut store, &deal, "pass  1c").unwrap();
        let b = get_or_create_node(&mut store, &deal, "P 1C").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.history, "P 1C");
        assert_eq!(a.seat, Seat::East);
        assert_eq!(store.deal_node_keys(deal.id).len(), 1);
    }

    #[test]
    fn test_closed_node_needs_nobody() {
        let (mut store, deal) = seeded();
        let key = get_or_create_node(&mut store, &deal, "P P P P").unwrap();
        let node = store.node(&key).unwrap();
        assert_eq!(node.status, NodeStatus::Closed);
        assert_eq!(node.who_needs, WhoNeeds::None);
    }

    #[test]
    fn test_build_tree_groups_agreement_into_one_edge() {
        let (mut store, deal) = seeded();
        let root = get_or_create_node(&mut store, &deal, "").unwrap();
        store.record_active_response(&root, CREATOR, Call::Pass);
        store.record_active_response(&root, PARTNER, Call::Pass);

        let tree = build_tree(&mut store, deal.id).unwrap();
        assert_eq!(tree.edges.len(), 1);
        assert_eq!(tree.edges[0].call, "P");
        assert_eq!(
            tree.edges[0].by,
            vec![PartnerRole::Creator, PartnerRole::Partner]
        );
        assert!(!tree.nodes[&tree.root].divergence);
        // The agreed child node now exists.
        assert!(tree.nodes.contains_key("N|P"));
    }

    #[test]
    fn test_build_tree_marks_divergence() {
        let (mut store, deal) = seeded();
        let root = get_or_create_node(&mut store, &deal, "").unwrap();
        store.record_active_response(&root, CREATOR, Call::Pass);
        store.record_active_response(&root, PARTNER, "1C".parse().unwrap());

        let tree = build_tree(&mut store, deal.id).unwrap();
        assert!(tree.nodes[&tree.root].divergence);
        assert_eq!(tree.edges.len(), 2);
        assert!(tree.nodes.contains_key("N|P"));
        assert!(tree.nodes.contains_key("N|1C"));
    }

    #[test]
    fn test_build_tree_is_idempotent() {
        let (mut store, deal) = seeded();
        let root = get_or_create_node(&mut store, &deal, "").unwrap();
        store.record_active_response(&root, CREATOR, Call::Pass);
        store.record_active_response(&root, PARTNER, "1C".parse().unwrap());

        let first = build_tree(&mut store, deal.id).unwrap();
        let second = build_tree(&mut store, deal.id).unwrap();
        assert_eq!(first.nodes, second.nodes);
        assert_eq!(first.edges, second.edges);
    }

    #[test]
    fn test_rebuild_drops_edges_of_revised_calls() {
        let (mut store, deal) = seeded();
        let root = get_or_create_node(&mut store, &deal, "").unwrap();
        store.record_active_response(&root, CREATOR, Call::Pass);
        build_tree(&mut store, deal.id).unwrap();

        // Revising the root call supersedes the pass; its edge must not
        // survive the next rebuild.
        store.record_active_response(&root, CREATOR, "1D".parse().unwrap());
        let tree = build_tree(&mut store, deal.id).unwrap();
        assert_eq!(tree.edges.len(), 1);
        assert_eq!(tree.edges[0].call, "1D");
        assert_eq!(tree.edges[0].by, vec![PartnerRole::Creator]);
    }

    #[test]
    fn test_snapshot_includes_orphans() {
        let (mut store, deal) = seeded();
        // A node with no responses and no edge to it.
        get_or_create_node(&mut store, &deal, "1C 1H").unwrap();
        let tree = build_tree(&mut store, deal.id).unwrap();
        assert!(tree.nodes.contains_key("S|1C 1H"));
    }
}
