//! Deployment networks an attested service may target.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Target deployment network named in an attestation record.
///
/// Known networks form a closed set; any other label parses to [`Network::Unlisted`],
/// which can never appear in an allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Network {
    /// Ethereum mainnet.
    EthereumMainnet,
    /// Ethereum Sepolia testnet.
    EthereumSepolia,
    /// Arbitrum One.
    ArbitrumMainnet,
    /// Arbitrum Sepolia testnet.
    ArbitrumSepolia,
    /// Base mainnet.
    BaseMainnet,
    /// Base Sepolia testnet.
    BaseSepolia,
    /// Optimism mainnet.
    OptimismMainnet,
    /// Optimism Sepolia testnet.
    OptimismSepolia,
    /// Polygon PoS mainnet.
    PolygonMainnet,
    /// A label outside the known set, kept verbatim for diagnostics.
    Unlisted(String),
}

impl Network {
    /// Every known network, in a stable order.
    pub const KNOWN: [Self; 9] = [
        Self::EthereumMainnet,
        Self::EthereumSepolia,
        Self::ArbitrumMainnet,
        Self::ArbitrumSepolia,
        Self::BaseMainnet,
        Self::BaseSepolia,
        Self::OptimismMainnet,
        Self::OptimismSepolia,
        Self::PolygonMainnet,
    ];

    /// Parse a network label, case-insensitive, accepting short aliases.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "ethereum-mainnet" | "ethereum" | "mainnet" => Self::EthereumMainnet,
            "ethereum-sepolia" | "sepolia" => Self::EthereumSepolia,
            "arbitrum-mainnet" | "arbitrum" | "arbitrum-one" => Self::ArbitrumMainnet,
            "arbitrum-sepolia" => Self::ArbitrumSepolia,
            "base-mainnet" | "base" => Self::BaseMainnet,
            "base-sepolia" => Self::BaseSepolia,
            "optimism-mainnet" | "optimism" => Self::OptimismMainnet,
            "optimism-sepolia" => Self::OptimismSepolia,
            "polygon-mainnet" | "polygon" => Self::PolygonMainnet,
            _ => Self::Unlisted(label.to_string()),
        }
    }

    /// Canonical label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::EthereumMainnet => "ethereum-mainnet",
            Self::EthereumSepolia => "ethereum-sepolia",
            Self::ArbitrumMainnet => "arbitrum-mainnet",
            Self::ArbitrumSepolia => "arbitrum-sepolia",
            Self::BaseMainnet => "base-mainnet",
            Self::BaseSepolia => "base-sepolia",
            Self::OptimismMainnet => "optimism-mainnet",
            Self::OptimismSepolia => "optimism-sepolia",
            Self::PolygonMainnet => "polygon-mainnet",
            Self::Unlisted(label) => label,
        }
    }

    /// Whether this is one of the known networks.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unlisted(_))
    }
}

impl FromStr for Network {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::parse(&label))
    }
}
