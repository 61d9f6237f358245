//! Wallet-derived peer identity.

use crate::utils::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Chain family a wallet address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    /// EVM chains; addresses compare case-insensitively
    Ethereum,
    /// Bitcoin
    Bitcoin,
    /// Solana
    Solana,
    /// Tron
    Tron,
}

impl ChainType {
    /// Lowercase tag used in string encodings
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Bitcoin => "bitcoin",
            Self::Solana => "solana",
            Self::Tron => "tron",
        }
    }

    fn normalize(self, address: &str) -> String {
        let address = address.trim();
        match self {
            // EIP-55 checksums are presentation only
            Self::Ethereum => address.to_ascii_lowercase(),
            _ => address.to_string(),
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = crate::utils::MessengerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "evm" => Ok(Self::Ethereum),
            "bitcoin" | "btc" => Ok(Self::Bitcoin),
            "solana" | "sol" => Ok(Self::Solana),
            "tron" | "trx" => Ok(Self::Tron),
            _ => Err(NetworkError::MalformedAddress {
                address: s.to_string(),
                reason: "unknown chain type".to_string(),
            }
            .into()),
        }
    }
}

/// Stable peer identity. Equality and hashing use (address, chain type);
/// the display name is carried along but never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerId {
    address: String,
    chain_type: ChainType,
    display_name: String,
}

/// Build a deterministic identity from a wallet address
pub fn create_peer_id(
    address: impl AsRef<str>,
    chain_type: ChainType,
    display_name: impl Into<String>,
) -> PeerId {
    PeerId::new(address, chain_type, display_name)
}

impl PeerId {
    /// Build a deterministic identity from a wallet address
    pub fn new(
        address: impl AsRef<str>,
        chain_type: ChainType,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            address: chain_type.normalize(address.as_ref()),
            chain_type,
            display_name: display_name.into(),
        }
    }

    /// Normalized wallet address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Chain family
    pub fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    /// Human display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Short label for logs
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.address.chars().collect();
        if chars.len() <= 12 {
            return self.address.clone();
        }
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.chain_type == other.chain_type
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.chain_type.hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.chain_type, &self.address).cmp(&(other.chain_type, &other.address))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_type, self.address)
    }
}

impl FromStr for PeerId {
    type Err = crate::utils::MessengerError;

    /// Parses `chain:address`; the display name is left empty
    fn from_str(s: &str) -> Result<Self> {
        let (chain, address) = s.split_once(':').ok_or_else(|| NetworkError::MalformedAddress {
            address: s.to_string(),
            reason: "expected <chain>:<address>".to_string(),
        })?;
        if address.is_empty() || address.contains(['/', ' ']) {
            return Err(NetworkError::MalformedAddress {
                address: s.to_string(),
                reason: "invalid wallet address".to_string(),
            }
            .into());
        }
        Ok(Self::new(address, chain.parse()?, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_display_name() {
        let a = PeerId::new("0xAbC", ChainType::Ethereum, "Alice");
        let b = PeerId::new("0xabc", ChainType::Ethereum, "alice's phone");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_chain_type_distinguishes() {
        let eth = PeerId::new("abc", ChainType::Ethereum, "x");
        let sol = PeerId::new("abc", ChainType::Solana, "x");
        assert_ne!(eth, sol);
    }

    #[test]
    fn test_non_evm_addresses_keep_case() {
        let a = PeerId::new("So1AbC", ChainType::Solana, "");
        let b = PeerId::new("so1abc", ChainType::Solana, "");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let peer = create_peer_id("0xB0B", ChainType::Ethereum, "Bob");
        let text = peer.to_string();
        assert_eq!(text, "ethereum:0xb0b");
        assert_eq!(text.parse::<PeerId>().unwrap(), peer);

        assert!("nochain".parse::<PeerId>().is_err());
        assert!("doge:0x1".parse::<PeerId>().is_err());
        assert!("ethereum:".parse::<PeerId>().is_err());
    }
}
