use crate::call::Strain;
use crate::seat::{Partnership, Seat};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DoubleStatus {
    #[default]
    Undoubled,
    Doubled,
    Redoubled,
}

impl DoubleStatus {
    pub fn suffix(self) -> &'static str {
        match self {
            DoubleStatus::Undoubled => "",
            DoubleStatus::Doubled => "X",
            DoubleStatus::Redoubled => "XX",
        }
    }
}

/// The outstanding bid (with doubling status) when an auction ends.
/// `owner` is the seat that made the final bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    pub level: u8,
    pub strain: Strain,
    pub double_status: DoubleStatus,
    pub owner: Seat,
}

impl Contract {
    pub fn partnership(&self) -> Partnership {
        self.owner.partnership()
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.level,
            self.strain.render(),
            self.double_status.suffix()
        )
    }
}
