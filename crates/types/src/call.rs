use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strain {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
    NoTrump,
}

impl Strain {
    pub const ALL: [Strain; 5] = [
        Strain::Clubs,
        Strain::Diamonds,
        Strain::Hearts,
        Strain::Spades,
        Strain::NoTrump,
    ];

    /// Rank used for bid comparison: C < D < H < S < NT.
    pub fn rank(self) -> u8 {
        match self {
            Strain::Clubs => 0,
            Strain::Diamonds => 1,
            Strain::Hearts => 2,
            Strain::Spades => 3,
            Strain::NoTrump => 4,
        }
    }

    pub fn render(self) -> &'static str {
        match self {
            Strain::Clubs => "C",
            Strain::Diamonds => "D",
            Strain::Hearts => "H",
            Strain::Spades => "S",
            Strain::NoTrump => "NT",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "C" => Some(Strain::Clubs),
            "D" => Some(Strain::Diamonds),
            "H" => Some(Strain::Hearts),
            "S" => Some(Strain::Spades),
            "NT" | "N" => Some(Strain::NoTrump),
            _ => None,
        }
    }
}

impl fmt::Display for Strain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized call: {input}")]
pub struct ParseCallError {
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Call {
    Pass,
    Double,
    Redouble,
    Bid { level: u8, strain: Strain },
}

impl Call {
    pub fn is_bid(&self) -> bool {
        matches!(self, Call::Bid { .. })
    }

    /// Comparison value of a bid: `level * 5 + strain rank`. A bid is legal
    /// only if its value strictly exceeds the current highest bid's value.
    pub fn value(&self) -> Option<u8> {
        match self {
            Call::Bid { level, strain } => Some(level * 5 + strain.rank()),
            _ => None,
        }
    }

    pub fn render(self) -> String {
        match self {
            Call::Pass => "P".to_string(),
            Call::Double => "X".to_string(),
            Call::Redouble => "XX".to_string(),
            Call::Bid { level, strain } => format!("{}{}", level, strain.render()),
        }
    }
}

impl FromStr for Call {
    type Err = ParseCallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase();
        match norm.as_str() {
            "P" | "PASS" => return Ok(Call::Pass),
            "X" | "DBL" | "DOUBLE" => return Ok(Call::Double),
            "XX" | "RDBL" | "REDOUBLE" => return Ok(Call::Redouble),
            _ => {}
        }
        if norm.len() >= 2 {
            let mut chars = norm.chars();
            if let Some(level) = chars.next().and_then(|c| c.to_digit(10)) {
                if (1..=7).contains(&level) {
                    if let Some(strain) = Strain::from_symbol(&norm[1..]) {
                        return Ok(Call::Bid {
                            level: level as u8,
                            strain,
                        });
                    }
                }
            }
        }
        Err(ParseCallError {
            input: s.to_string(),
        })
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("P".parse::<Call>().unwrap(), Call::Pass);
        assert_eq!("pass".parse::<Call>().unwrap(), Call::Pass);
        assert_eq!("X".parse::<Call>().unwrap(), Call::Double);
        assert_eq!("Double".parse::<Call>().unwrap(), Call::Double);
        assert_eq!("XX".parse::<Call>().unwrap(), Call::Redouble);
        assert_eq!("Redouble".parse::<Call>().unwrap(), Call::Redouble);
    }

    #[test]
    fn test_parse_bids() {
        assert_eq!(
            "1C".parse::<Call>().unwrap(),
            Call::Bid {
                level: 1,
                strain: Strain::Clubs
            }
        );
        assert_eq!(
            "7NT".parse::<Call>().unwrap(),
            Call::Bid {
                level: 7,
                strain: Strain::NoTrump
            }
        );
        assert_eq!(
            "3n".parse::<Call>().unwrap(),
            Call::Bid {
                level: 3,
                strain: Strain::NoTrump
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Call>().is_err());
        assert!("0C".parse::<Call>().is_err());
        assert!("8S".parse::<Call>().is_err());
        assert!("1Z".parse::<Call>().is_err());
        assert!("zzz".parse::<Call>().is_err());
    }

    #[test]
    fn test_bid_values_ordered() {
        let value = |s: &str| s.parse::<Call>().unwrap().value().unwrap();
        assert!(value("1NT") > value("1S"));
        assert!(value("1S") > value("1H"));
        assert!(value("1H") > value("1D"));
        assert!(value("1D") > value("1C"));
        assert!(value("2C") > value("1NT"));
        assert_eq!("P".parse::<Call>().unwrap().value(), None);
    }

    #[test]
    fn test_render_round_trip() {
        for s in ["P", "X", "XX", "1C", "4H", "7NT"] {
            let call: Call = s.parse().unwrap();
            assert_eq!(call.render(), s);
        }
    }
}
