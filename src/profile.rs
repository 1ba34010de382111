//! VPN profile model and read-only profile store
//!
//! Profiles identify a VPN endpoint and its split-tunnel policy. They are
//! loaded from a TOML file and never mutated by the orchestrator.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile store: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse profile store: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Duplicate profile name: {0}")]
    DuplicateName(String),
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),
}

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Create a network, clearing any host bits in `addr`
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ProfileError> {
        if prefix > 32 {
            return Err(ProfileError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        let mask = Self::mask_bits(prefix);
        let network = Ipv4Addr::from(u32::from(addr) & mask);
        Ok(Self {
            addr: network,
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Dotted-quad netmask (e.g. 255.0.0.0 for /8)
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask_bits(self.prefix))
    }

    /// True if `other` is fully contained in this network
    pub fn contains(&self, other: &Cidr) -> bool {
        if other.prefix < self.prefix {
            return false;
        }
        let mask = Self::mask_bits(self.prefix);
        (u32::from(other.addr) & mask) == u32::from(self.addr)
    }
}

impl FromStr for Cidr {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, prefix) = s
            .split_once('/')
            .ok_or_else(|| ProfileError::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = network
            .parse()
            .map_err(|_| ProfileError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ProfileError::InvalidCidr(s.to_string()))?;
        Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Which traffic goes through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitTunnelPolicy {
    /// Everything through the tunnel; the VPN client installs the default
    /// route itself and no explicit rules are needed
    AllTraffic,
    /// Only `include` ranges through the tunnel, `exclude` ranges pinned to
    /// the physical interface
    Split {
        include: Vec<Cidr>,
        exclude: Vec<Cidr>,
    },
}

/// A VPN endpoint definition, immutable once loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub server: String,
    #[serde(default)]
    pub authgroup: Option<String>,
    pub policy: SplitTunnelPolicy,
}

// On-disk shape: [[profile]] tables with flat route lists
#[derive(Debug, Deserialize)]
struct StoreFile {
    #[serde(rename = "profile", default)]
    profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Deserialize)]
struct ProfileEntry {
    name: String,
    server: String,
    #[serde(default)]
    authgroup: Option<String>,
    #[serde(default)]
    tunnel_all: bool,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

/// Read-only collection of profiles loaded from disk
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: Vec<Profile>,
}

impl ProfileStore {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        let file: StoreFile = toml::from_str(&content)?;

        let mut profiles = Vec::with_capacity(file.profiles.len());
        for entry in file.profiles {
            if profiles.iter().any(|p: &Profile| p.name == entry.name) {
                return Err(ProfileError::DuplicateName(entry.name));
            }
            let policy = if entry.tunnel_all {
                SplitTunnelPolicy::AllTraffic
            } else {
                let include = entry
                    .include
                    .iter()
                    .map(|s| s.parse())
                    .collect::<Result<Vec<Cidr>, _>>()?;
                let exclude = entry
                    .exclude
                    .iter()
                    .map(|s| s.parse())
                    .collect::<Result<Vec<Cidr>, _>>()?;
                SplitTunnelPolicy::Split { include, exclude }
            };
            profiles.push(Profile {
                name: entry.name,
                server: entry.server,
                authgroup: entry.authgroup,
                policy,
            });
        }

        info!("Loaded {} VPN profiles", profiles.len());
        Ok(Self { profiles })
    }

    pub fn from_profiles(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Default profile file contents written by `init`
pub fn default_store_toml() -> &'static str {
    r#"# VPN profiles
#
# tunnel_all = true routes everything through the tunnel (no explicit rules).
# Otherwise list include/exclude CIDR ranges for split tunneling.

[[profile]]
name = "vpn-main"
server = "vpn.example.com"
tunnel_all = false
include = ["10.0.0.0/8"]
exclude = []
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert_eq!(cidr.prefix(), 8);
        assert_eq!(cidr.netmask().to_string(), "255.0.0.0");
    }

    #[test]
    fn test_cidr_clears_host_bits() {
        let cidr: Cidr = "192.168.1.77/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_cidr_invalid() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_cidr_contains() {
        let wide: Cidr = "10.0.0.0/8".parse().unwrap();
        let narrow: Cidr = "10.1.0.0/16".parse().unwrap();
        let other: Cidr = "192.168.0.0/16".parse().unwrap();

        assert!(wide.contains(&narrow));
        assert!(!narrow.contains(&wide));
        assert!(!wide.contains(&other));
        assert!(wide.contains(&wide));
    }

    #[test]
    fn test_cidr_serde_roundtrip() {
        let cidr: Cidr = "172.16.0.0/12".parse().unwrap();
        let json = serde_json::to_string(&cidr).unwrap();
        assert_eq!(json, "\"172.16.0.0/12\"");
        let parsed: Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cidr);
    }

    #[test]
    fn test_store_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        std::fs::write(
            &path,
            r#"
            [[profile]]
            name = "vpn-main"
            server = "vpn.example.com"
            include = ["10.0.0.0/8"]

            [[profile]]
            name = "vpn-full"
            server = "vpn2.example.com"
            authgroup = "staff"
            tunnel_all = true
            "#,
        )
        .unwrap();

        let store = ProfileStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);

        let main = store.get("vpn-main").unwrap();
        assert_eq!(main.server, "vpn.example.com");
        assert_eq!(
            main.policy,
            SplitTunnelPolicy::Split {
                include: vec!["10.0.0.0/8".parse().unwrap()],
                exclude: vec![],
            }
        );

        let full = store.get("vpn-full").unwrap();
        assert_eq!(full.authgroup.as_deref(), Some("staff"));
        assert_eq!(full.policy, SplitTunnelPolicy::AllTraffic);

        assert!(store.get("nope").is_none());
    }

    #[test]
    fn test_store_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        std::fs::write(
            &path,
            r#"
            [[profile]]
            name = "dup"
            server = "a.example.com"
            tunnel_all = true

            [[profile]]
            name = "dup"
            server = "b.example.com"
            tunnel_all = true
            "#,
        )
        .unwrap();

        let result = ProfileStore::load(&path);
        assert!(matches!(result, Err(ProfileError::DuplicateName(_))));
    }

    #[test]
    fn test_store_rejects_bad_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        std::fs::write(
            &path,
            r#"
            [[profile]]
            name = "bad"
            server = "a.example.com"
            include = ["10.0.0.0/40"]
            "#,
        )
        .unwrap();

        let result = ProfileStore::load(&path);
        assert!(matches!(result, Err(ProfileError::InvalidCidr(_))));
    }

    #[test]
    fn test_default_store_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        std::fs::write(&path, default_store_toml()).unwrap();

        let store = ProfileStore::load(&path).unwrap();
        assert_eq!(store.names(), vec!["vpn-main".to_string()]);
    }
}
