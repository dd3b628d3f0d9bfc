use core::{fmt::Display, str::FromStr};

use bitcoin::network::Magic;
use bitcoin::Network as BitcoinNetwork;
use thiserror::Error;

/// Port used by websocket peer-exchange gateways when none is configured.
pub const DEFAULT_WEB_PORT: u16 = 8192;

/// Mainnet DNS seeds.
const MAINNET_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.org",
];
/// Testnet DNS seeds.
const TESTNET_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "testnet-seed.bluematt.me",
];
/// Signet DNS seeds.
const SIGNET_SEEDS: &[&str] = &["seed.signet.bitcoin.sprovoost.nl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
/// Default Bitcoin network types.
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn to_bitcoin_network(&self) -> BitcoinNetwork {
        match self {
            Network::Bitcoin => BitcoinNetwork::Bitcoin,
            Network::Testnet => BitcoinNetwork::Testnet,
            Network::Signet => BitcoinNetwork::Signet,
            Network::Regtest => BitcoinNetwork::Regtest,
        }
    }

    pub fn magic(&self) -> Magic {
        self.to_bitcoin_network().magic()
    }

    /// Default peer-to-peer port of the network.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Bitcoin => 8333,
            Network::Testnet => 18333,
            Network::Signet => 38333,
            Network::Regtest => 18444,
        }
    }

    /// Well-known DNS seeds of the network. Empty for networks that have none.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Bitcoin => MAINNET_SEEDS,
            Network::Testnet => TESTNET_SEEDS,
            Network::Signet => SIGNET_SEEDS,
            Network::Regtest => &[],
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        Network::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl From<BitcoinNetwork> for Network {
    fn from(network: BitcoinNetwork) -> Self {
        match network {
            BitcoinNetwork::Bitcoin => Self::Bitcoin,
            BitcoinNetwork::Testnet => Self::Testnet,
            BitcoinNetwork::Signet => Self::Signet,
            _ => Self::Regtest,
        }
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(Self::Bitcoin),
            "testnet" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(NetworkParseError::UnknownType),
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkParseError {
    #[error("Unknown network type")]
    UnknownType,
}

/// A web seed: a peer-exchange gateway session to open at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSeed {
    /// Exchange transport, eg. `"websocket"`.
    pub transport: String,
    /// Remote host.
    pub address: String,
    /// Remote port.
    pub port: u16,
}

impl WebSeed {
    pub fn new(transport: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
            port,
        }
    }
}

/// Parse a web seed from a URL-ish string, eg. `wss://seed.example.com:8192`.
/// The scheme is optional; the transport normalizes to `websocket` and the
/// port falls back to [`DEFAULT_WEB_PORT`].
impl FromStr for WebSeed {
    type Err = WebSeedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("wss://")
            .or_else(|| s.strip_prefix("ws://"))
            .unwrap_or(s);

        if rest.is_empty() {
            return Err(WebSeedParseError::MissingHost(s.to_owned()));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| WebSeedParseError::InvalidPort(s.to_owned()))?;
                (host, port)
            }
            None => (rest, DEFAULT_WEB_PORT),
        };
        if host.is_empty() {
            return Err(WebSeedParseError::MissingHost(s.to_owned()));
        }

        Ok(Self::new("websocket", host, port))
    }
}

#[derive(Debug, Error)]
pub enum WebSeedParseError {
    #[error("web seed {0:?} has no host")]
    MissingHost(String),
    #[error("web seed {0:?} has an invalid port")]
    InvalidPort(String),
}

/// Network parameters of a peer group.
#[derive(Debug, Clone)]
pub struct Params {
    /// The network this group belongs to.
    pub network: Network,
    /// Network message magic.
    pub magic: Magic,
    /// DNS seed hostnames.
    pub dns_seeds: Vec<String>,
    /// Static peers, as `host[:port]` strings.
    pub static_peers: Vec<String>,
    /// Default peer-to-peer port.
    pub default_port: u16,
    /// Default port of peer-exchange gateways.
    pub default_web_port: u16,
    /// Peer-exchange sessions to open at startup.
    pub web_seeds: Vec<WebSeed>,
}

impl Params {
    /// Parameters of a well-known network.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            magic: network.magic(),
            dns_seeds: network.dns_seeds().iter().map(|s| (*s).to_owned()).collect(),
            static_peers: Vec::new(),
            default_port: network.default_port(),
            default_web_port: DEFAULT_WEB_PORT,
            web_seeds: Vec::new(),
        }
    }

    /// The network id handed to peer-exchange implementations: the message
    /// magic as lowercase hex.
    pub fn magic_hex(&self) -> String {
        self.magic
            .to_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "bitcoin"),
            Network::Testnet => write!(f, "testnet"),
            Network::Signet => write!(f, "signet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_web_seed_parsing() {
        let seed = WebSeed::from_str("wss://seed.example.com:9000").unwrap();
        assert_eq!(seed, WebSeed::new("websocket", "seed.example.com", 9000));

        let seed = WebSeed::from_str("seed.example.com").unwrap();
        assert_eq!(
            seed,
            WebSeed::new("websocket", "seed.example.com", DEFAULT_WEB_PORT)
        );

        let seed = WebSeed::from_str("ws://10.0.0.1:8192").unwrap();
        assert_eq!(seed, WebSeed::new("websocket", "10.0.0.1", 8192));

        assert!(WebSeed::from_str("wss://").is_err());
        assert!(WebSeed::from_str("host:not-a-port").is_err());
    }

    #[test]
    fn test_params_presets() {
        let params = Params::new(Network::Bitcoin);
        assert_eq!(params.default_port, 8333);
        assert!(!params.dns_seeds.is_empty());
        assert_eq!(params.magic_hex(), "f9beb4d9");

        let params = Params::new(Network::Regtest);
        assert_eq!(params.default_port, 18444);
        assert!(params.dns_seeds.is_empty());
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!(Network::from_str("signet").unwrap(), Network::Signet);
        assert!(Network::from_str("mainnet").is_err());
    }
}
