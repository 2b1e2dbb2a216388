//! Divergence detection and the who-needs engine: which partner still owes
//! a response at each node, including the same-seat exemption under a
//! divergent ancestor.

use crate::error::EngineError;
use crate::model::{
    history_extends, Deal, Node, NodeKey, NodeStatus, PartnerRole, SequenceEntry, Session, UserId,
    WhoNeeds,
};
use crate::store::Store;
use crate::tree::get_or_create_node;
use types::auction::{render_history, CallError};
use types::call::Call;
use types::seat::Seat;

/// Refresh a node's divergence flag from its active responses. Returns
/// whether the flag changed.
pub fn recompute_divergence(store: &mut Store, key: &NodeKey) -> Result<bool, EngineError> {
    let mut calls: Vec<Call> = store
        .active_responses_at(key)
        .iter()
        .map(|r| r.call)
        .collect();
    calls.sort();
    calls.dedup();
    let divergent = calls.len() >= 2;
    let node = store.expect_node_mut(key)?;
    let changed = node.divergence != divergent;
    node.divergence = divergent;
    Ok(changed)
}

/// Nearest ancestor of `key` that is divergent and where the same seat was
/// to act. Only such an ancestor can make the node's branches "the other
/// partner's line" for this seat.
pub fn same_seat_divergence_ancestor(
    store: &Store,
    deal: &Deal,
    key: &NodeKey,
) -> Result<Option<Node>, EngineError> {
    let calls = key.calls()?;
    for depth in (0..calls.len()).rev() {
        if Seat::at_depth(deal.dealer, depth) != key.seat {
            continue;
        }
        let ancestor = NodeKey::new(
            deal.id,
            render_history(&calls[..depth]),
            Seat::at_depth(deal.dealer, depth),
        );
        if let Some(node) = store.node(&ancestor) {
            if node.divergence {
                return Ok(Some(node.clone()));
            }
        }
    }
    Ok(None)
}

/// Which partner alone chose the branch (the call made at `ancestor`) that
/// leads toward `key`. None when the branch call was chosen by both or by
/// neither.
pub fn branch_owner(
    store: &Store,
    session: &Session,
    ancestor: &NodeKey,
    key: &NodeKey,
) -> Result<Option<PartnerRole>, EngineError> {
    let calls = key.calls()?;
    let branch_call = match calls.get(ancestor.depth()) {
        Some(&call) => call,
        None => return Ok(None),
    };
    let mut choosers: Vec<PartnerRole> = store
        .active_responses_at(ancestor)
        .iter()
        .filter(|r| r.call == branch_call)
        .filter_map(|r| session.role_of(r.user))
        .collect();
    choosers.sort();
    choosers.dedup();
    match choosers.as_slice() {
        [role] => Ok(Some(*role)),
        _ => Ok(None),
    }
}

/// Recompute a node's who-needs flags. A partner needs the node when they
/// have no active response there, except under the same-seat exemption:
/// below a divergent node where this seat acted, the partner who did not
/// choose this branch is not required to follow it unless they have
/// already participated in it. Returns whether the flags changed.
pub fn update_who_needs(
    store: &mut Store,
    session: &Session,
    deal: &Deal,
    key: &NodeKey,
) -> Result<bool, EngineError> {
    let closed = store.expect_node(key)?.status == NodeStatus::Closed;
    let who_needs = if closed {
        WhoNeeds::None
    } else {
        let needs = |store: &Store, user: UserId| store.active_response(key, user).is_none();
        let mut needs_creator = needs(store, session.creator);
        let mut needs_partner = needs(store, session.partner);

        if let Some(ancestor) = same_seat_divergence_ancestor(store, deal, key)? {
            if let Some(owner) = branch_owner(store, session, &ancestor.key, key)? {
                let other = owner.other();
                let still_needed = match other {
                    PartnerRole::Creator => needs_creator,
                    PartnerRole::Partner => needs_partner,
                };
                if still_needed {
                    // Participation is judged against the branch prefix:
                    // the ancestor's history plus the branch call.
                    let calls = key.calls()?;
                    let branch = render_history(&calls[..=ancestor.depth]);
                    let participated =
                        store.user_active_in_branch(deal.id, &branch, session.user_for(other));
                    if !participated {
                        match other {
                            PartnerRole::Creator => needs_creator = false,
                            PartnerRole::Partner => needs_partner = false,
                        }
                    }
                }
            }
        }
        WhoNeeds::from_flags(needs_creator, needs_partner)
    };

    let node = store.expect_node_mut(key)?;
    let changed = node.who_needs != who_needs;
    node.who_needs = who_needs;
    Ok(changed)
}

/// Recompute who-needs at every deeper node where the same seat acts.
/// Run after a node's divergence flag flips, since that is what gates the
/// same-seat exemption below it.
pub fn update_descendants_who_needs(
    store: &mut Store,
    session: &Session,
    deal: &Deal,
    key: &NodeKey,
) -> Result<(), EngineError> {
    for descendant in store.deal_node_keys(deal.id) {
        if descendant.seat == key.seat && history_extends(&key.history, &descendant.history) {
            update_who_needs(store, session, deal, &descendant)?;
        }
    }
    Ok(())
}

/// Record one partner's call at a position: upsert the node and the active
/// response, refresh divergence and who-needs (cascading to same-seat
/// descendants when divergence flips), eagerly create the resulting child,
/// and extend the user's flattened sequence when the position continues it.
#[allow(clippy::too_many_arguments)]
pub fn record_response(
    store: &mut Store,
    session: &Session,
    deal: &Deal,
    user: UserId,
    history: &str,
    seat: Seat,
    call: Call,
    alert: Option<String>,
) -> Result<NodeKey, EngineError> {
    let key = get_or_create_node(store, deal, history)?;
    if seat != key.seat {
        return Err(EngineError::Validation(CallError::NotYourTurn {
            expected: key.seat,
            got: seat,
        }));
    }

    let was_divergent = store.expect_node(&key)?.divergence;
    store.record_active_response(&key, user, call);
    recompute_divergence(store, &key)?;
    update_who_needs(store, session, deal, &key)?;
    if store.expect_node(&key)?.divergence != was_divergent {
        update_descendants_who_needs(store, session, deal, &key)?;
    }

    let child_key = key.child(call);
    let child = get_or_create_node(store, deal, &child_key.history)?;
    update_who_needs(store, session, deal, &child)?;

    let sequence = store.ensure_sequence(deal.id, user);
    if sequence.history() == key.history {
        let index = sequence.entries.len();
        sequence.entries.push(SequenceEntry {
            seat,
            call,
            alert,
            index,
        });
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DealId, SessionId};
    use types::seat::Vulnerability;

    const CREATOR: UserId = UserId(10);
    const PARTNER: UserId = UserId(20);

    fn seeded() -> (Store, Session, Deal) {
        let mut store = Store::new();
        let session = Session {
            id: SessionId(1),
            creator: CREATOR,
            partner: PARTNER,
        };
        store.put_session(session);
        let deal = Deal {
            id: DealId(1),
            session: SessionId(1),
            number: 1,
            dealer: Seat::West,
            vulnerability: Vulnerability::None,
        };
        store.put_deal(deal).unwrap();
        (store, session, deal)
    }

    fn call(s: &str) -> Call {
        s.parse().unwrap()
    }

    #[test]
    fn test_divergence_needs_two_distinct_calls() {
        let (mut store, session, deal) = seeded();
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        let root = NodeKey::root(deal.id, deal.dealer);
        assert!(!store.node(&root).unwrap().divergence);

        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        assert!(!store.node(&root).unwrap().divergence);

        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, call("1C"), None,
        )
        .unwrap();
        assert!(store.node(&root).unwrap().divergence);
    }

    #[test]
    fn test_who_needs_reflects_answers() {
        let (mut store, session, deal) = seeded();
        let root = NodeKey::root(deal.id, deal.dealer);
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        assert_eq!(store.node(&root).unwrap().who_needs, WhoNeeds::Partner);

        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        assert_eq!(store.node(&root).unwrap().who_needs, WhoNeeds::None);
    }

    #[test]
    fn test_same_seat_exemption_skips_non_owner() {
        let (mut store, session, deal) = seeded();
        // Dealer is West, so West acts at depth 0 and again at depth 4.
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, call("1C"), None,
        )
        .unwrap();

        // Depth-4 node inside the creator-only "P" branch: West to act again.
        let key = get_or_create_node(&mut store, &deal, "P 1C P 1H").unwrap();
        assert_eq!(key.seat, Seat::West);
        update_who_needs(&mut store, &session, &deal, &key).unwrap();
        assert_eq!(store.node(&key).unwrap().who_needs, WhoNeeds::Creator);
    }

    #[test]
    fn test_participation_revokes_exemption() {
        let (mut store, session, deal) = seeded();
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, call("1C"), None,
        )
        .unwrap();
        // The partner steps into the creator's branch at depth 1.
        record_response(
            &mut store, &session, &deal, PARTNER, "P", Seat::North, call("1C"), None,
        )
        .unwrap();

        let key = get_or_create_node(&mut store, &deal, "P 1C P 1H").unwrap();
        update_who_needs(&mut store, &session, &deal, &key).unwrap();
        assert_eq!(store.node(&key).unwrap().who_needs, WhoNeeds::Both);
    }

    #[test]
    fn test_no_exemption_without_sole_owner() {
        let (mut store, session, deal) = seeded();
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        record_response(
            &mut store, &session, &deal, PARTNER, "", Seat::West, call("1C"), None,
        )
        .unwrap();
        let root = NodeKey::root(deal.id, deal.dealer);
        assert_eq!(
            branch_owner(
                &store,
                &session,
                &root,
                &NodeKey::new(deal.id, "P 1C P 1H", Seat::West),
            )
            .unwrap(),
            Some(PartnerRole::Creator)
        );
        // A branch neither partner chose at the divergent node has no
        // owner, so nobody is exempt below it.
        assert_eq!(
            branch_owner(
                &store,
                &session,
                &root,
                &NodeKey::new(deal.id, "1D P P 1H", Seat::West),
            )
            .unwrap(),
            None
        );
        let key = get_or_create_node(&mut store, &deal, "1D P P 1H").unwrap();
        update_who_needs(&mut store, &session, &deal, &key).unwrap();
        assert_eq!(store.node(&key).unwrap().who_needs, WhoNeeds::Both);
    }

    #[test]
    fn test_record_response_extends_matching_sequence() {
        let (mut store, session, deal) = seeded();
        record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::West, Call::Pass, None,
        )
        .unwrap();
        record_response(
            &mut store,
            &session,
            &deal,
            CREATOR,
            "P",
            Seat::North,
            call("1C"),
            Some("could be short".to_string()),
        )
        .unwrap();

        let sequence = store.sequence(deal.id, CREATOR).unwrap();
        assert_eq!(sequence.history(), "P 1C");
        assert_eq!(sequence.entries[1].seat, Seat::North);
        assert_eq!(sequence.entries[1].alert.as_deref(), Some("could be short"));

        // Answering somewhere off the user's own line leaves the sequence alone.
        record_response(
            &mut store, &session, &deal, CREATOR, "1D", Seat::North, Call::Pass, None,
        )
        .unwrap();
        assert_eq!(store.sequence(deal.id, CREATOR).unwrap().history(), "P 1C");
    }

    #[test]
    fn test_wrong_seat_rejected() {
        let (mut store, session, deal) = seeded();
        let err = record_response(
            &mut store, &session, &deal, CREATOR, "", Seat::North, Call::Pass, None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(CallError::NotYourTurn { .. })
        ));
    }
}
