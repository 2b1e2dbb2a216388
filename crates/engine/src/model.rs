use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use types::auction;
use types::call::{Call, ParseCallError};
use types::seat::{Seat, Vulnerability};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(SessionId);
id_type!(DealId);
id_type!(UserId);

/// Which of the two practicing partners a user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartnerRole {
    Creator,
    Partner,
}

impl PartnerRole {
    pub fn other(self) -> Self {
        match self {
            PartnerRole::Creator => PartnerRole::Partner,
            PartnerRole::Partner => PartnerRole::Creator,
        }
    }
}

/// Two identified partner users practicing together. Provided fully formed
/// by the identity collaborator; the engine never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub creator: UserId,
    pub partner: UserId,
}

impl Session {
    pub fn role_of(&self, user: UserId) -> Option<PartnerRole> {
        if user == self.creator {
            Some(PartnerRole::Creator)
        } else if user == self.partner {
            Some(PartnerRole::Partner)
        } else {
            None
        }
    }

    pub fn user_for(&self, role: PartnerRole) -> UserId {
        match role {
            PartnerRole::Creator => self.creator,
            PartnerRole::Partner => self.partner,
        }
    }
}

/// One dealt board within a session. Immutable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub session: SessionId,
    pub number: u32,
    pub dealer: Seat,
    pub vulnerability: Vulnerability,
}

/// Identity of a public tree position: (deal, call-history prefix,
/// seat to act). Never an incrementing counter, so repeated tree builds
/// are idempotent and safe to race.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub deal: DealId,
    pub history: String,
    pub seat: Seat,
}

impl NodeKey {
    pub fn new(deal: DealId, history: impl Into<String>, seat: Seat) -> Self {
        Self {
            deal,
            history: history.into(),
            seat,
        }
    }

    pub fn root(deal: DealId, dealer: Seat) -> Self {
        Self::new(deal, "", dealer)
    }

    pub fn is_root(&self) -> bool {
        self.history.is_empty()
    }

    pub fn depth(&self) -> usize {
        if self.history.is_empty() {
            0
        } else {
            self.history.split_whitespace().count()
        }
    }

    pub fn calls(&self) -> Result<Vec<Call>, ParseCallError> {
        auction::parse_history(&self.history)
    }

    /// Key of the child reached by making `call` here.
    pub fn child(&self, call: Call) -> NodeKey {
        let history = if self.history.is_empty() {
            call.render()
        } else {
            format!("{} {}", self.history, call.render())
        };
        NodeKey::new(self.deal, history, self.seat.next())
    }

    /// Key of the parent position, derived by stripping the last call and
    /// recomputing the seat from the dealer. None at the root.
    pub fn parent(&self, dealer: Seat) -> Option<NodeKey> {
        if self.is_root() {
            return None;
        }
        let tokens: Vec<&str> = self.history.split_whitespace().collect();
        let history = tokens[..tokens.len() - 1].join(" ");
        let seat = Seat::at_depth(dealer, tokens.len() - 1);
        Some(NodeKey::new(self.deal, history, seat))
    }

    /// Stable composite label used as the node id in snapshots.
    pub fn label(&self) -> String {
        format!("{}|{}", self.seat.to_char(), self.history)
    }
}

/// True if `history` extends `prefix` by at least one call.
pub fn history_extends(prefix: &str, history: &str) -> bool {
    if prefix.is_empty() {
        !history.is_empty()
    } else {
        history
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(' '))
    }
}

/// True if `history` equals `prefix` or extends it (token-aware, so
/// "P 1C" is not treated as a prefix of "P 1CX").
pub fn history_within(prefix: &str, history: &str) -> bool {
    history == prefix || history_extends(prefix, history)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Open,
    Closed,
}

/// Which partner(s) still owe a response at a node. A derived cache,
/// recomputable from responses and ancestor divergence at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhoNeeds {
    None,
    Creator,
    Partner,
    Both,
}

impl WhoNeeds {
    pub fn from_flags(needs_creator: bool, needs_partner: bool) -> Self {
        match (needs_creator, needs_partner) {
            (true, true) => WhoNeeds::Both,
            (true, false) => WhoNeeds::Creator,
            (false, true) => WhoNeeds::Partner,
            (false, false) => WhoNeeds::None,
        }
    }

    pub fn includes(self, role: PartnerRole) -> bool {
        match self {
            WhoNeeds::None => false,
            WhoNeeds::Both => true,
            WhoNeeds::Creator => role == PartnerRole::Creator,
            WhoNeeds::Partner => role == PartnerRole::Partner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: NodeKey,
    pub depth: usize,
    pub divergence: bool,
    pub status: NodeStatus,
    pub who_needs: WhoNeeds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SupersedeReason {
    Rewind,
    Undo,
    Merge,
}

impl fmt::Display for SupersedeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupersedeReason::Rewind => write!(f, "REWIND"),
            SupersedeReason::Undo => write!(f, "UNDO"),
            SupersedeReason::Merge => write!(f, "MERGE"),
        }
    }
}

/// Responses are soft-versioned: superseding one records why and when,
/// never hard-deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseState {
    Active,
    Superseded {
        reason: SupersedeReason,
        at: DateTime<Utc>,
    },
}

impl ResponseState {
    pub fn is_active(&self) -> bool {
        matches!(self, ResponseState::Active)
    }
}

/// One partner's chosen call at one node. At most one active response per
/// (node, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub node: NodeKey,
    pub user: UserId,
    pub call: Call,
    pub state: ResponseState,
    /// Store-monotonic stamp; total order for "most recent" queries.
    pub stamp: u64,
    pub at: DateTime<Utc>,
}

/// Append-only record written whenever a response is superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAudit {
    pub user: UserId,
    pub node: NodeKey,
    pub old_call: Call,
    pub reason: SupersedeReason,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Set of partner roles that produced an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleSet {
    pub creator: bool,
    pub partner: bool,
}

impl RoleSet {
    pub fn insert(&mut self, role: PartnerRole) {
        match role {
            PartnerRole::Creator => self.creator = true,
            PartnerRole::Partner => self.partner = true,
        }
    }

    pub fn roles(&self) -> Vec<PartnerRole> {
        let mut out = Vec::new();
        if self.creator {
            out.push(PartnerRole::Creator);
        }
        if self.partner {
            out.push(PartnerRole::Partner);
        }
        out
    }
}

/// A materialized observed transition, derived entirely from active
/// responses; deleted and recreated as responses are invalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeKey,
    pub to: NodeKey,
    pub call: Call,
    pub by: RoleSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub seat: Seat,
    pub call: Call,
    pub alert: Option<String>,
    pub index: usize,
}

/// One partner's flattened, ordered list of their own calls for a deal.
/// Mutable projection; truncated on rewind/undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSequence {
    pub deal: DealId,
    pub user: UserId,
    pub entries: Vec<SequenceEntry>,
}

impl UserSequence {
    pub fn history(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.call.render())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
