use crate::call::{Call, ParseCallError, Strain};
use crate::contract::{Contract, DoubleStatus};
use crate::seat::Seat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a proposed call was rejected. Always recoverable; the reason is
/// reported to the caller verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("auction already ended")]
    AuctionEnded,
    #[error("it's {expected}'s turn to act, not {got}'s")]
    NotYourTurn { expected: Seat, got: Seat },
    #[error(transparent)]
    Malformed(#[from] ParseCallError),
    #[error("invalid bid level: {level}")]
    InvalidLevel { level: u8 },
    #[error("illegal bid: {bid} is not higher than the current highest bid ({highest})")]
    InsufficientBid { bid: Call, highest: Call },
    #[error("illegal double: no bid to double")]
    DoubleWithoutBid,
    #[error("illegal double: current contract is already doubled or redoubled")]
    AlreadyDoubled,
    #[error("illegal double: opponents do not hold the current contract")]
    DoubleOwnSide,
    #[error("illegal redouble: no bid to redouble")]
    RedoubleWithoutBid,
    #[error("illegal redouble: current contract is not doubled")]
    RedoubleUndoubled,
    #[error("illegal redouble: your side is not currently doubled")]
    RedoubleOpponents,
}

/// The highest outstanding bid and the seat that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighestBid {
    pub level: u8,
    pub strain: Strain,
    pub owner: Seat,
}

impl HighestBid {
    pub fn call(&self) -> Call {
        Call::Bid {
            level: self.level,
            strain: self.strain,
        }
    }
}

/// Running state of one auction. Fully derivable from (dealer, calls) and
/// deterministic under replay, which is what makes history strings usable
/// as tree-node keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionState {
    pub dealer: Seat,
    pub seat_to_act: Seat,
    pub highest_bid: Option<HighestBid>,
    pub double_status: DoubleStatus,
    pub consecutive_passes: u8,
    pub calls: Vec<Call>,
    pub ended: bool,
    /// Set when the auction ends with a bid outstanding; an all-pass
    /// auction ends with `None` (passed out).
    pub contract: Option<Contract>,
}

impl AuctionState {
    pub fn new(dealer: Seat) -> Self {
        Self {
            dealer,
            seat_to_act: dealer,
            highest_bid: None,
            double_status: DoubleStatus::Undoubled,
            consecutive_passes: 0,
            calls: Vec::new(),
            ended: false,
            contract: None,
        }
    }

    /// Check a proposed call against the current state without applying it.
    pub fn validate(&self, call: Call, seat: Seat) -> Result<(), CallError> {
        if self.ended {
            return Err(CallError::AuctionEnded);
        }
        if seat != self.seat_to_act {
            return Err(CallError::NotYourTurn {
                expected: self.seat_to_act,
                got: seat,
            });
        }
        match call {
            Call::Pass => Ok(()),
            Call::Bid { level, .. } => {
                if !(1..=7).contains(&level) {
                    return Err(CallError::InvalidLevel { level });
                }
                if let Some(highest) = &self.highest_bid {
                    if call.value() <= highest.call().value() {
                        return Err(CallError::InsufficientBid {
                            bid: call,
                            highest: highest.call(),
                        });
                    }
                }
                Ok(())
            }
            Call::Double => {
                let highest = self.highest_bid.as_ref().ok_or(CallError::DoubleWithoutBid)?;
                if self.double_status != DoubleStatus::Undoubled {
                    return Err(CallError::AlreadyDoubled);
                }
                if highest.owner.partnership() == seat.partnership() {
                    return Err(CallError::DoubleOwnSide);
                }
                Ok(())
            }
            Call::Redouble => {
                let highest = self
                    .highest_bid
                    .as_ref()
                    .ok_or(CallError::RedoubleWithoutBid)?;
                if self.double_status != DoubleStatus::Doubled {
                    return Err(CallError::RedoubleUndoubled);
                }
                if highest.owner.partnership() != seat.partnership() {
                    return Err(CallError::RedoubleOpponents);
                }
                Ok(())
            }
        }
    }

    /// Apply a call that has already passed `validate`.
    pub fn apply(&mut self, call: Call, seat: Seat) {
        self.calls.push(call);
        match call {
            Call::Pass => {
                self.consecutive_passes += 1;
                if self.consecutive_passes == 4 && self.highest_bid.is_none() {
                    // Passed out: ended with no contract.
                    self.ended = true;
                } else if self.consecutive_passes == 3 && self.highest_bid.is_some() {
                    self.ended = true;
                    let highest = self.highest_bid.as_ref().unwrap();
                    self.contract = Some(Contract {
                        level: highest.level,
                        strain: highest.strain,
                        double_status: self.double_status,
                        owner: highest.owner,
                    });
                }
            }
            Call::Bid { level, strain } => {
                self.consecutive_passes = 0;
                self.highest_bid = Some(HighestBid {
                    level,
                    strain,
                    owner: seat,
                });
                self.double_status = DoubleStatus::Undoubled;
            }
            Call::Double => {
                self.consecutive_passes = 0;
                self.double_status = DoubleStatus::Doubled;
            }
            Call::Redouble => {
                self.consecutive_passes = 0;
                self.double_status = DoubleStatus::Redoubled;
            }
        }
        if !self.ended {
            self.seat_to_act = self.seat_to_act.next();
        }
    }

    /// Validate then apply in one step.
    pub fn try_call(&mut self, call: Call, seat: Seat) -> Result<(), CallError> {
        self.validate(call, seat)?;
        self.apply(call, seat);
        Ok(())
    }

    /// Rebuild the state by replaying an ordered call list from the dealer.
    pub fn replay(dealer: Seat, calls: &[Call]) -> Result<Self, CallError> {
        let mut state = Self::new(dealer);
        for &call in calls {
            let seat = state.seat_to_act;
            state.try_call(call, seat)?;
        }
        Ok(state)
    }

    /// Rebuild the state from a space-joined history string like "P 1C P".
    pub fn from_history(dealer: Seat, history: &str) -> Result<Self, CallError> {
        let calls = parse_history(history)?;
        Self::replay(dealer, &calls)
    }

    /// Parse and apply a single call. Panics on invalid input — for tests
    /// and known-good data only.
    pub fn bid(&mut self, s: &str) {
        let call = s.parse().expect("invalid call");
        let seat = self.seat_to_act;
        self.try_call(call, seat).expect("illegal call");
    }

    /// Parse and apply multiple space-separated calls like "P 1C P".
    /// Panics on invalid input — for tests and known-good data only.
    pub fn bids(&mut self, s: &str) {
        for token in s.split_whitespace() {
            self.bid(token);
        }
    }

    /// Build an auction state from space-separated calls. Panics on invalid
    /// input — for tests and known-good data only.
    pub fn bidding(dealer: Seat, calls: &str) -> Self {
        let mut state = Self::new(dealer);
        state.bids(calls);
        state
    }
}

/// Parse a space-joined history string into calls, normalizing aliases.
pub fn parse_history(history: &str) -> Result<Vec<Call>, ParseCallError> {
    history.split_whitespace().map(str::parse).collect()
}

/// Render calls back into the space-joined node-key form.
pub fn render_history(calls: &[Call]) -> String {
    calls
        .iter()
        .map(|c| c.render())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Closing rule as a pure function of history: four passes from the start,
/// or three trailing passes after any non-pass call.
pub fn history_closed(calls: &[Call]) -> bool {
    if calls.len() < 4 {
        return false;
    }
    if calls[..4].iter().all(|c| matches!(c, Call::Pass)) {
        return true;
    }
    let last_three = &calls[calls.len() - 3..];
    last_three.iter().all(|c| matches!(c, Call::Pass))
        && calls[..calls.len() - 3].iter().any(|c| !matches!(c, Call::Pass))
}

/// Project a call history onto the familiar four-column auction grid
/// (columns W N E S, first row offset by dealer).
pub fn auction_grid(dealer: Seat, calls: &[Call]) -> Vec<[Option<Call>; 4]> {
    // Column order is W N E S, so West is column 0.
    let start_col = (dealer.idx() + 1) % 4;
    let rows = std::cmp::max(1, (start_col + calls.len() + 3) / 4);
    let mut grid = vec![[None; 4]; rows];
    for (i, &call) in calls.iter().enumerate() {
        let abs = start_col + i;
        grid[abs / 4][abs % 4] = Some(call);
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_out() {
        let state = AuctionState::bidding(Seat::North, "P P P P");
        assert!(state.ended);
        assert_eq!(state.contract, None);
    }

    #[test]
    fn test_three_passes_after_bid_ends() {
        let mut state = AuctionState::bidding(Seat::North, "1C P P");
        assert!(!state.ended);
        state.bid("P");
        assert!(state.ended);
        let contract = state.contract.unwrap();
        assert_eq!(contract.to_string(), "1C");
        assert_eq!(contract.owner, Seat::North);
    }

    #[test]
    fn test_doubled_contract_carries_suffix() {
        let state = AuctionState::bidding(Seat::West, "1S X XX P P P");
        assert!(state.ended);
        assert_eq!(state.contract.unwrap().to_string(), "1SXX");
    }

    #[test]
    fn test_wrong_turn_rejected() {
        let state = AuctionState::new(Seat::West);
        let err = state.validate(Call::Pass, Seat::North).unwrap_err();
        assert_eq!(
            err,
            CallError::NotYourTurn {
                expected: Seat::West,
                got: Seat::North
            }
        );
    }

    #[test]
    fn test_call_after_end_rejected() {
        let state = AuctionState::bidding(Seat::North, "P P P P");
        assert_eq!(
            state.validate(Call::Pass, state.seat_to_act),
            Err(CallError::AuctionEnded)
        );
    }

    #[test]
    fn test_insufficient_bid_rejected() {
        let state = AuctionState::bidding(Seat::North, "1S");
        let bid = "1H".parse().unwrap();
        assert!(matches!(
            state.validate(bid, Seat::East),
            Err(CallError::InsufficientBid { .. })
        ));
        // 1NT outranks 1S, 2C outranks 1NT.
        let state = AuctionState::bidding(Seat::North, "1S");
        assert!(state.validate("1NT".parse().unwrap(), Seat::East).is_ok());
        let state = AuctionState::bidding(Seat::North, "1NT");
        assert!(state.validate("2C".parse().unwrap(), Seat::East).is_ok());
    }

    #[test]
    fn test_double_rules() {
        // No bid outstanding.
        let state = AuctionState::new(Seat::North);
        assert_eq!(
            state.validate(Call::Double, Seat::North),
            Err(CallError::DoubleWithoutBid)
        );
        // Doubling an opponent's bid is fine.
        let state = AuctionState::bidding(Seat::North, "1C");
        assert!(state.validate(Call::Double, Seat::East).is_ok());
        // Partner's bid cannot be doubled.
        let state = AuctionState::bidding(Seat::North, "1C P");
        assert_eq!(
            state.validate(Call::Double, Seat::South),
            Err(CallError::DoubleOwnSide)
        );
        // Already doubled.
        let state = AuctionState::bidding(Seat::North, "1C X P");
        assert_eq!(
            state.validate(Call::Double, Seat::West),
            Err(CallError::AlreadyDoubled)
        );
    }

    #[test]
    fn test_redouble_rules() {
        // Not doubled yet.
        let state = AuctionState::bidding(Seat::North, "1C");
        assert_eq!(
            state.validate(Call::Redouble, Seat::East),
            Err(CallError::RedoubleUndoubled)
        );
        // Own side doubled: redouble legal.
        let state = AuctionState::bidding(Seat::North, "1C X");
        assert!(state.validate(Call::Redouble, Seat::South).is_ok());
        // Opponents cannot redouble.
        let state = AuctionState::bidding(Seat::North, "1C X P");
        assert_eq!(
            state.validate(Call::Redouble, Seat::West),
            Err(CallError::RedoubleOpponents)
        );
    }

    #[test]
    fn test_new_bid_clears_double_status() {
        let state = AuctionState::bidding(Seat::North, "1C X 1S P P P");
        assert_eq!(state.contract.unwrap().to_string(), "1S");
    }

    #[test]
    fn test_replay_deterministic() {
        let calls = parse_history("P 1C P 1H X P P P").unwrap();
        let a = AuctionState::replay(Seat::West, &calls).unwrap();
        let b = AuctionState::replay(Seat::West, &calls).unwrap();
        assert_eq!(a, b);
        assert!(a.ended);
        assert_eq!(a.contract.unwrap().to_string(), "1HX");
    }

    #[test]
    fn test_replay_rejects_illegal_history() {
        let calls = parse_history("1S 1C").unwrap();
        assert!(AuctionState::replay(Seat::North, &calls).is_err());
    }

    #[test]
    fn test_history_round_trip() {
        let calls = parse_history("P 1C P 1H").unwrap();
        assert_eq!(render_history(&calls), "P 1C P 1H");
        // Aliases normalize on the way in.
        let calls = parse_history("Pass 1C Double Redouble").unwrap();
        assert_eq!(render_history(&calls), "P 1C X XX");
    }

    #[test]
    fn test_history_closed() {
        let closed = |s: &str| history_closed(&parse_history(s).unwrap());
        assert!(!closed(""));
        assert!(!closed("P P P"));
        assert!(closed("P P P P"));
        assert!(!closed("1C P P"));
        assert!(closed("1C P P P"));
        assert!(closed("P 1C P 1H P P P"));
        assert!(!closed("P 1C P 1H P P"));
    }

    #[test]
    fn test_auction_grid_dealer_offset() {
        let calls = parse_history("P 1C P").unwrap();
        let grid = auction_grid(Seat::North, &calls);
        assert_eq!(grid.len(), 1);
        // Columns are W N E S; North deals, so West's first cell is empty.
        assert_eq!(grid[0][0], None);
        assert_eq!(grid[0][1], Some(Call::Pass));
        assert_eq!(grid[0][2], Some("1C".parse().unwrap()));
        assert_eq!(grid[0][3], Some(Call::Pass));
    }

    #[test]
    fn test_auction_grid_wraps_rows() {
        let calls = parse_history("1C P P P").unwrap();
        let grid = auction_grid(Seat::South, &calls);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0][3], Some("1C".parse().unwrap()));
        assert_eq!(grid[1][2], Some(Call::Pass));
    }

    #[test]
    fn test_seat_rotation_from_dealer() {
        let state = AuctionState::bidding(Seat::West, "P 1C P");
        assert_eq!(state.seat_to_act, Seat::South);
    }

    #[test]
    fn test_state_serde_round_trip() {
        let state = AuctionState::bidding(Seat::West, "P 1C X XX P");
        let json = serde_json::to_string(&state).unwrap();
        let back: AuctionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
