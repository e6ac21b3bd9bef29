//! Pure key-derivation for the quote cache: turns request parameters into the
//! canonical string used both as the Quote Store key and as the pair-key used
//! by the tier registry.

use std::fmt;

/// Trade direction carried by a quote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    ExactIn,
    ExactOut,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactIn => write!(f, "exactin"),
            Self::ExactOut => write!(f, "exactout"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = super::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exactin" => Ok(Self::ExactIn),
            "exactout" => Ok(Self::ExactOut),
            other => Err(super::error::EngineError::BadRequest(format!(
                "unknown tradeType '{other}'"
            ))),
        }
    }
}

const NAMESPACE: &str = "price";

/// Canonical `chain:tokenIn:tokenOut` pair identifier, lowercased.
///
/// This is the string used by the Tier Registry — it deliberately excludes
/// amount and direction, which only the Fingerprint carries.
pub fn pair_key(chain: &str, token_in: &str, token_out: &str) -> String {
    format!(
        "{}:{}:{}",
        chain.trim().to_lowercase(),
        token_in.trim().to_lowercase(),
        token_out.trim().to_lowercase()
    )
}

/// Full cache key: namespace-prefixed, colon-delimited, case-folded.
///
/// Equal parameter tuples (after case-normalization) produce equal
/// fingerprints; distinct tuples produce distinct fingerprints.
pub fn fingerprint(
    chain: &str,
    token_in: &str,
    token_out: &str,
    amount: &str,
    direction: Direction,
) -> String {
    format!(
        "{NAMESPACE}:{}:{}:{}:{}:{}",
        chain.trim().to_lowercase(),
        token_in.trim().to_lowercase(),
        token_out.trim().to_lowercase(),
        amount.trim().to_lowercase(),
        direction,
    )
}
