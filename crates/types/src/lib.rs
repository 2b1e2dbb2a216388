pub mod auction;
pub mod call;
pub mod contract;
pub mod seat;

pub use auction::{AuctionState, CallError, HighestBid};
pub use call::{Call, ParseCallError, Strain};
pub use contract::{Contract, DoubleStatus};
pub use seat::{Partnership, Seat, Vulnerability};
