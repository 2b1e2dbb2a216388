//! Task scheduling: pick the next node a user should answer. Rule 1 looks
//! four calls deeper in the deal they just answered (the same seat comes
//! around again every four calls); rule 2 falls back to a random eligible
//! deal, preferring one they were not just working on, at its shallowest
//! eligible node.

use crate::error::EngineError;
use crate::model::{history_within, Deal, NodeKey, NodeStatus, Session, UserId};
use crate::store::Store;
use crate::tree::get_or_create_node;
use rand::Rng;
use serde::Serialize;
use types::seat::Seat;

/// Source of random indices. Injected so tests can script the draw.
pub trait Draw: Send {
    /// Uniform index in `0..n`. `n` is at least 1.
    fn pick(&mut self, n: usize) -> usize;
}

pub struct ThreadRngDraw;

impl Draw for ThreadRngDraw {
    fn pick(&mut self, n: usize) -> usize {
        rand::thread_rng().gen_range(0..n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NextReason {
    #[serde(rename = "PLUS4")]
    Plus4,
    #[serde(rename = "RANDOM_DEAL_SMALLEST_DEPTH")]
    RandomDealSmallestDepth,
    #[serde(rename = "ALL_CAUGHT_UP")]
    AllCaughtUp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRef {
    pub node: NodeKey,
    pub deal_number: u32,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextTask {
    pub node: Option<TaskRef>,
    pub reason: NextReason,
}

impl NextTask {
    pub fn all_caught_up() -> Self {
        Self {
            node: None,
            reason: NextReason::AllCaughtUp,
        }
    }
}

/// The seat this user would naturally occupy at `key`, given their own
/// bidding line. On their own branch it is one past their last call; on a
/// foreign branch it follows their deepest answer along the path to the
/// node, or the node's own seat if they have none there yet.
pub fn natural_seat(store: &Store, deal: &Deal, user: UserId, key: &NodeKey) -> Seat {
    let user_history = store
        .sequence(deal.id, user)
        .map(|s| s.history())
        .unwrap_or_default();
    if user_history.is_empty() {
        return deal.dealer;
    }
    if history_within(&key.history, &user_history) || history_within(&user_history, &key.history) {
        return Seat::at_depth(deal.dealer, user_history.split_whitespace().count());
    }
    let path_response = store
        .active_responses_for_user_in_deal(deal.id, user)
        .into_iter()
        .filter(|r| history_within(&r.node.history, &key.history))
        .last();
    match path_response {
        Some(response) => response.node.seat.next(),
        None => key.seat,
    }
}

/// A node the user can be handed: open, still needing them, unanswered by
/// them, and reached at their natural seat.
pub fn is_candidate(
    store: &Store,
    session: &Session,
    deal: &Deal,
    user: UserId,
    key: &NodeKey,
) -> bool {
    let Some(role) = session.role_of(user) else {
        return false;
    };
    let Some(node) = store.node(key) else {
        return false;
    };
    node.status == NodeStatus::Open
        && node.who_needs.includes(role)
        && store.active_response(key, user).is_none()
        && natural_seat(store, deal, user, key) == key.seat
}

fn candidate_at_depth(
    store: &Store,
    session: &Session,
    deal: &Deal,
    user: UserId,
    depth: usize,
) -> Option<NodeKey> {
    store
        .deal_node_keys(deal.id)
        .into_iter()
        .filter(|k| k.depth() == depth)
        .find(|k| is_candidate(store, session, deal, user, k))
}

fn smallest_depth_candidate(
    store: &Store,
    session: &Session,
    deal: &Deal,
    user: UserId,
) -> Option<NodeKey> {
    store
        .deal_node_keys(deal.id)
        .into_iter()
        .find(|k| is_candidate(store, session, deal, user, k))
}

/// Pick the next node for the user across the whole session, making sure
/// every deal at least has its root.
pub fn next_node(
    store: &mut Store,
    session: &Session,
    user: UserId,
    draw: &mut dyn Draw,
) -> Result<NextTask, EngineError> {
    let deals = store.deals_in_session(session.id);
    for deal in &deals {
        get_or_create_node(store, deal, "")?;
    }

    let last = store
        .latest_active_response(session.id, user)
        .map(|r| (r.node.deal, r.node.depth()));

    if let Some((deal_id, depth)) = last {
        let deal = store.deal(deal_id)?;
        if let Some(key) = candidate_at_depth(store, session, &deal, user, depth + 4) {
            return Ok(NextTask {
                node: Some(TaskRef {
                    node: key,
                    deal_number: deal.number,
                    depth: depth + 4,
                }),
                reason: NextReason::Plus4,
            });
        }
    }

    let eligible: Vec<&Deal> = deals
        .iter()
        .filter(|d| smallest_depth_candidate(store, session, d, user).is_some())
        .collect();
    if eligible.is_empty() {
        return Ok(NextTask::all_caught_up());
    }

    let pool: Vec<&Deal> = match last {
        Some((last_deal, _)) if eligible.len() > 1 => {
            let others: Vec<&Deal> = eligible
                .iter()
                .copied()
                .filter(|d| d.id != last_deal)
                .collect();
            if others.is_empty() {
                eligible
            } else {
                others
            }
        }
        _ => eligible,
    };

    let deal = pool[draw.pick(pool.len())];
    match smallest_depth_candidate(store, session, deal, user) {
        Some(key) => {
            let depth = key.depth();
            Ok(NextTask {
                node: Some(TaskRef {
                    node: key,
                    deal_number: deal.number,
                    depth,
                }),
                reason: NextReason::RandomDealSmallestDepth,
            })
        }
        None => Ok(NextTask::all_caught_up()),
    }
}
