use crate::error::{EngineError, Missing};
use crate::model::{
    history_within, Deal, DealId, Edge, Node, NodeKey, Response, ResponseAudit, ResponseState,
    Session, SessionId, SupersedeReason, UserId, UserSequence,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use types::call::Call;

/// Bounded retry/backoff for deal-lock acquisition. Exhaustion surfaces as
/// a retryable `EngineError::Conflict`.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 8,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }
}

/// Shared persistent state: sessions, deals, nodes, responses, the audit
/// log, edges, and flattened user sequences. All compound mutations run
/// under the owning deal's lock held by the caller.
#[derive(Debug, Default)]
pub struct Store {
    sessions: HashMap<SessionId, Session>,
    deals: HashMap<DealId, Deal>,
    nodes: HashMap<NodeKey, Node>,
    responses: Vec<Response>,
    audits: Vec<ResponseAudit>,
    edges: Vec<Edge>,
    sequences: HashMap<(DealId, UserId), UserSequence>,
    clock: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_session(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn put_deal(&mut self, deal: Deal) -> Result<(), EngineError> {
        if !self.sessions.contains_key(&deal.session) {
            return Err(EngineError::NotFound(Missing::Session(deal.session)));
        }
        self.deals.insert(deal.id, deal);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Result<Session, EngineError> {
        self.sessions
            .get(&id)
            .copied()
            .ok_or(EngineError::NotFound(Missing::Session(id)))
    }

    pub fn deal(&self, id: DealId) -> Result<Deal, EngineError> {
        self.deals
            .get(&id)
            .copied()
            .ok_or(EngineError::NotFound(Missing::Deal(id)))
    }

    pub fn session_of_deal(&self, id: DealId) -> Result<Session, EngineError> {
        let deal = self.deal(id)?;
        self.session(deal.session)
    }

    /// Deals of a session ordered by deal number.
    pub fn deals_in_session(&self, session: SessionId) -> Vec<Deal> {
        let mut deals: Vec<Deal> = self
            .deals
            .values()
            .filter(|d| d.session == session)
            .copied()
            .collect();
        deals.sort_by_key(|d| d.number);
        deals
    }

    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn node_mut(&mut self, key: &NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn expect_node(&self, key: &NodeKey) -> Result<&Node, EngineError> {
        self.nodes
            .get(key)
            .ok_or_else(|| EngineError::NotFound(Missing::Node(key.label())))
    }

    pub fn expect_node_mut(&mut self, key: &NodeKey) -> Result<&mut Node, EngineError> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(Missing::Node(key.label())))
    }

    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.key.clone(), node);
    }

    /// All node keys of a deal, ordered by (depth, history, seat) so scans
    /// and scheduler picks are deterministic.
    pub fn deal_node_keys(&self, deal: DealId) -> Vec<NodeKey> {
        let mut keys: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|k| k.deal == deal)
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            (a.depth(), &a.history, a.seat.idx()).cmp(&(b.depth(), &b.history, b.seat.idx()))
        });
        keys
    }

    pub fn active_response(&self, key: &NodeKey, user: UserId) -> Option<&Response> {
        self.responses
            .iter()
            .find(|r| r.state.is_active() && r.user == user && &r.node == key)
    }

    pub fn active_responses_at(&self, key: &NodeKey) -> Vec<&Response> {
        self.responses
            .iter()
            .filter(|r| r.state.is_active() && &r.node == key)
            .collect()
    }

    pub fn active_responses_for_user_in_deal(&self, deal: DealId, user: UserId) -> Vec<&Response> {
        let mut out: Vec<&Response> = self
            .responses
            .iter()
            .filter(|r| r.state.is_active() && r.user == user && r.node.deal == deal)
            .collect();
        out.sort_by_key(|r| (r.node.depth(), r.stamp));
        out
    }

    /// The user's most recent active response anywhere in the session.
    pub fn latest_active_response(&self, session: SessionId, user: UserId) -> Option<&Response> {
        self.responses
            .iter()
            .filter(|r| {
                r.state.is_active()
                    && r.user == user
                    && self
                        .deals
                        .get(&r.node.deal)
                        .is_some_and(|d| d.session == session)
            })
            .max_by_key(|r| r.stamp)
    }

    /// True if the user holds an active response at any node inside the
    /// branch rooted at `branch_history` (inclusive).
    pub fn user_active_in_branch(&self, deal: DealId, branch_history: &str, user: UserId) -> bool {
        self.responses.iter().any(|r| {
            r.state.is_active()
                && r.user == user
                && r.node.deal == deal
                && history_within(branch_history, &r.node.history)
        })
    }

    /// Deactivate the user's active response at a node, writing one audit
    /// entry. Returns the superseded call, if there was one.
    pub fn supersede(
        &mut self,
        key: &NodeKey,
        user: UserId,
        reason: SupersedeReason,
        metadata: serde_json::Value,
    ) -> Option<Call> {
        let at = Utc::now();
        let response = self
            .responses
            .iter_mut()
            .find(|r| r.state.is_active() && r.user == user && &r.node == key)?;
        let old_call = response.call;
        response.state = ResponseState::Superseded { reason, at };
        self.audits.push(ResponseAudit {
            user,
            node: key.clone(),
            old_call,
            reason,
            metadata,
            at,
        });
        Some(old_call)
    }

    /// Upsert the (node, user) active response. A prior active response at
    /// the same node is superseded with reason `Merge` and audited.
    pub fn record_active_response(&mut self, key: &NodeKey, user: UserId, call: Call) {
        let _ = self.supersede(
            key,
            user,
            SupersedeReason::Merge,
            serde_json::json!({ "replaced_with": call.render() }),
        );
        let stamp = self.tick();
        self.responses.push(Response {
            node: key.clone(),
            user,
            call,
            state: ResponseState::Active,
            stamp,
            at: Utc::now(),
        });
    }

    pub fn audits_for_deal(&self, deal: DealId) -> Vec<&ResponseAudit> {
        self.audits
            .iter()
            .filter(|a| a.node.deal == deal)
            .collect()
    }

    pub fn sequence(&self, deal: DealId, user: UserId) -> Option<&UserSequence> {
        self.sequences.get(&(deal, user))
    }

    pub fn sequence_mut(&mut self, deal: DealId, user: UserId) -> Option<&mut UserSequence> {
        self.sequences.get_mut(&(deal, user))
    }

    pub fn ensure_sequence(&mut self, deal: DealId, user: UserId) -> &mut UserSequence {
        self.sequences
            .entry((deal, user))
            .or_insert_with(|| UserSequence {
                deal,
                user,
                entries: Vec::new(),
            })
    }

    pub fn sequences_for_deal(&self, deal: DealId) -> Vec<&UserSequence> {
        let mut out: Vec<&UserSequence> = self
            .sequences
            .values()
            .filter(|s| s.deal == deal)
            .collect();
        out.sort_by_key(|s| s.user);
        out
    }

    /// Create or update the edge keyed by (from, to, call).
    pub fn upsert_edge(&mut self, edge: Edge) {
        if let Some(existing) = self
            .edges
            .iter_mut()
            .find(|e| e.from == edge.from && e.to == edge.to && e.call == edge.call)
        {
            existing.by = edge.by;
        } else {
            self.edges.push(edge);
        }
    }

    pub fn edges_for_deal(&self, deal: DealId) -> Vec<Edge> {
        self.edges
            .iter()
            .filter(|e| e.from.deal == deal)
            .cloned()
            .collect()
    }

    pub fn remove_edge(&mut self, from: &NodeKey, to: &NodeKey, call: Call) -> bool {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(&e.from == from && &e.to == to && e.call == call));
        self.edges.len() < before
    }

    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
