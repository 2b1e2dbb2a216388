//! Asynchronous bidding-practice engine: two partners answer the same
//! deals independently, and the engine maintains the shared auction tree,
//! divergence and who-needs state, rewind/undo with an audit trail, and
//! the next-task scheduler on top of it.
//!
//! [`Engine`] is the concurrency shell. Compound operations take a
//! per-deal lock with bounded backoff, then mutate the [`store::Store`]
//! under a single write guard, so every operation is atomic per deal.

pub mod error;
pub mod model;
pub mod needs;
pub mod rewind;
pub mod scheduler;
pub mod store;
pub mod tree;

pub use error::{EngineError, Missing};
pub use model::{
    Deal, DealId, Edge, Node, NodeKey, NodeStatus, PartnerRole, Response, ResponseAudit,
    ResponseState, RoleSet, SequenceEntry, Session, SessionId, SupersedeReason, UserId,
    UserSequence, WhoNeeds,
};
pub use rewind::{RewindOutcome, RewindPreview, RewindReport, UndoOutcome};
pub use scheduler::{Draw, NextReason, NextTask, TaskRef, ThreadRngDraw};
pub use store::{LockPolicy, Store};
pub use tree::{EdgeView, NodeView, TreeSnapshot};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use types::auction::AuctionState;
use types::call::Call;
use types::seat::Seat;

type DealGuard = ArcMutexGuard<RawMutex, ()>;

/// Result of recording one call: the node answered, the auction state
/// after the call, and the node's refreshed derived flags.
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub node: NodeKey,
    pub call: String,
    pub auction: AuctionState,
    pub who_needs: WhoNeeds,
    pub divergence: bool,
}

/// One row of a user's per-deal progress view.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressNode {
    pub history: String,
    pub seat: Seat,
    pub depth: usize,
    pub call: Option<String>,
    pub status: NodeStatus,
    pub who_needs: WhoNeeds,
}

pub struct Engine {
    store: RwLock<Store>,
    deal_locks: Mutex<HashMap<DealId, Arc<Mutex<()>>>>,
    policy: LockPolicy,
    draw: Mutex<Box<dyn Draw>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_draw(Box::new(ThreadRngDraw))
    }

    /// Build an engine with a scripted draw source, for deterministic
    /// scheduling in tests.
    pub fn with_draw(draw: Box<dyn Draw>) -> Self {
        Self {
            store: RwLock::new(Store::new()),
            deal_locks: Mutex::new(HashMap::new()),
            policy: LockPolicy::default(),
            draw: Mutex::new(draw),
        }
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_session(&self, session: Session) {
        self.store.write().put_session(session);
    }

    pub fn add_deal(&self, deal: Deal) -> Result<(), EngineError> {
        self.store.write().put_deal(deal)
    }

    /// Acquire the per-deal lock with bounded exponential backoff. Losing
    /// the race past the retry budget surfaces as a retryable conflict.
    fn lock_deal(&self, deal: DealId) -> Result<DealGuard, EngineError> {
        let lock = {
            let mut locks = self.deal_locks.lock();
            locks
                .entry(deal)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let mut backoff = self.policy.initial_backoff;
        for _ in 0..=self.policy.retries {
            if let Some(guard) = lock.try_lock_arc() {
                return Ok(guard);
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
        Err(EngineError::Conflict(deal))
    }

    /// Validate and record one call by `user` at the position reached by
    /// `history`, with `seat` the seat they believe is to act. The call is
    /// checked against full auction legality before anything is written.
    pub fn record_call(
        &self,
        deal_id: DealId,
        user: UserId,
        history: &str,
        seat: Seat,
        call: &str,
        alert: Option<String>,
    ) -> Result<CallOutcome, EngineError> {
        let _guard = self.lock_deal(deal_id)?;
        let mut store = self.store.write();
        let deal = store.deal(deal_id)?;
        let session = store.session(deal.session)?;
        if session.role_of(user).is_none() {
            return Err(EngineError::Invariant(format!(
                "user {} is not a member of session {}",
                user, session.id
            )));
        }

        let call: Call = call.parse()?;
        let mut auction = AuctionState::from_history(deal.dealer, history)?;
        auction.validate(call, seat)?;

        let node = needs::record_response(
            &mut store, &session, &deal, user, history, seat, call, alert,
        )?;
        auction.apply(call, seat);
        info!(deal = %deal_id, user = %user, node = %node.label(), call = %call, "call recorded");

        let stored = store.expect_node(&node)?;
        Ok(CallOutcome {
            node: node.clone(),
            call: call.render(),
            auction,
            who_needs: stored.who_needs,
            divergence: stored.divergence,
        })
    }

    /// Rebuild and snapshot the deal's tree.
    pub fn tree(&self, deal_id: DealId) -> Result<TreeSnapshot, EngineError> {
        let _guard = self.lock_deal(deal_id)?;
        let mut store = self.store.write();
        tree::build_tree(&mut store, deal_id)
    }

    /// Next node the user should answer, across all deals of the session.
    pub fn next_task(&self, session_id: SessionId, user: UserId) -> Result<NextTask, EngineError> {
        let mut draw = self.draw.lock();
        let mut store = self.store.write();
        let session = store.session(session_id)?;
        scheduler::next_node(&mut store, &session, user, draw.as_mut())
    }

    /// Rewind the user's line back to `target`. With `preview` set this
    /// only reports what would be deleted; otherwise `confirm` must be set
    /// and the rewind is applied, audited, and followed by a fresh task.
    pub fn rewind(
        &self,
        deal_id: DealId,
        user: UserId,
        target: &NodeKey,
        confirm: bool,
        preview: bool,
    ) -> Result<RewindReport, EngineError> {
        if target.deal != deal_id {
            return Err(EngineError::NotFound(Missing::Node(target.label())));
        }
        let mut draw = self.draw.lock();
        let _guard = self.lock_deal(deal_id)?;
        let mut store = self.store.write();
        let deal = store.deal(deal_id)?;
        let session = store.session(deal.session)?;
        if session.role_of(user).is_none() {
            return Err(EngineError::Invariant(format!(
                "user {} is not a member of session {}",
                user, session.id
            )));
        }

        if preview {
            return Ok(RewindReport::Preview(rewind::preview(
                &store, &deal, user, target,
            )?));
        }
        if !confirm {
            return Err(EngineError::ConfirmRequired);
        }

        let (deleted, affected, edges_deleted) = rewind::apply_rewind(
            &mut store,
            &session,
            &deal,
            user,
            target,
            SupersedeReason::Rewind,
        )?;
        info!(
            deal = %deal_id,
            user = %user,
            target = %target.label(),
            deleted,
            "rewind applied"
        );
        let next_task = scheduler::next_node(&mut store, &session, user, draw.as_mut())?;
        Ok(RewindReport::Applied(RewindOutcome {
            deleted_responses: deleted,
            affected_nodes: affected,
            edges_deleted,
            next_task,
        }))
    }

    /// Undo the user's most recent call in the session: rewind to the
    /// parent of the node it was made at. A call made at the root cannot
    /// be undone this way, since there is no parent to rewind to.
    pub fn undo(&self, session_id: SessionId, user: UserId) -> Result<UndoOutcome, EngineError> {
        let mut draw = self.draw.lock();
        let deal_id = {
            let store = self.store.read();
            store.session(session_id)?;
            store
                .latest_active_response(session_id, user)
                .map(|r| r.node.deal)
                .ok_or(EngineError::NoActiveResponses)?
        };

        let _guard = self.lock_deal(deal_id)?;
        let mut store = self.store.write();
        let session = store.session(session_id)?;
        let latest = store
            .latest_active_response(session_id, user)
            .ok_or(EngineError::NoActiveResponses)?;
        // The latest response may have moved to another deal while we were
        // taking the lock; treat that as a lost race.
        if latest.node.deal != deal_id {
            return Err(EngineError::Conflict(deal_id));
        }
        let node = latest.node.clone();
        let undone_call = latest.call;
        let deal = store.deal(deal_id)?;

        let parent = node
            .parent(deal.dealer)
            .ok_or(EngineError::CannotUndoRoot)?;
        if store.node(&parent).is_none() {
            tracing::error!(node = %parent.label(), "parent node missing during undo");
            return Err(EngineError::Invariant(format!(
                "parent node {} missing",
                parent.label()
            )));
        }

        let (deleted, affected, _) = rewind::apply_rewind(
            &mut store,
            &session,
            &deal,
            user,
            &parent,
            SupersedeReason::Undo,
        )?;
        info!(deal = %deal_id, user = %user, node = %node.label(), "undo applied");
        let next_task = scheduler::next_node(&mut store, &session, user, draw.as_mut())?;
        Ok(UndoOutcome {
            undone_call: undone_call.render(),
            undone_history: node.history,
            deal_number: deal.number,
            deleted_responses: deleted,
            affected_nodes: affected,
            next_task,
        })
    }

    /// The user's view of their own line through a deal: the root, then
    /// every position they have actively answered, shallowest first.
    pub fn progress(&self, deal_id: DealId, user: UserId) -> Result<Vec<ProgressNode>, EngineError> {
        let store = self.store.read();
        let deal = store.deal(deal_id)?;
        let mut rows = Vec::new();

        let root = NodeKey::root(deal.id, deal.dealer);
        if store.active_response(&root, user).is_none() {
            if let Some(node) = store.node(&root) {
                rows.push(ProgressNode {
                    history: root.history.clone(),
                    seat: root.seat,
                    depth: 0,
                    call: None,
                    status: node.status,
                    who_needs: node.who_needs,
                });
            }
        }
        for response in store.active_responses_for_user_in_deal(deal.id, user) {
            let node = store.expect_node(&response.node)?;
            rows.push(ProgressNode {
                history: response.node.history.clone(),
                seat: response.node.seat,
                depth: node.depth,
                call: Some(response.call.render()),
                status: node.status,
                who_needs: node.who_needs,
            });
        }
        Ok(rows)
    }

    /// Both partners' flattened sequences for a deal.
    pub fn sequences(&self, deal_id: DealId) -> Result<Vec<UserSequence>, EngineError> {
        let store = self.store.read();
        store.deal(deal_id)?;
        Ok(store
            .sequences_for_deal(deal_id)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Append-only audit trail of superseded responses for a deal.
    pub fn audit_log(&self, deal_id: DealId) -> Result<Vec<ResponseAudit>, EngineError> {
        let store = self.store.read();
        store.deal(deal_id)?;
        Ok(store
            .audits_for_deal(deal_id)
            .into_iter()
            .cloned()
            .collect())
    }
}
