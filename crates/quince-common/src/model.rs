//! Identity and region attribute types shared by every Quince crate

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Opaque identity of a process participating in the cluster.
///
/// Supplied by the membership layer. Identities are totally ordered so that
/// simultaneous first-creation races can be broken deterministically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Consistency contract a region commits to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// Visible to the local member only
    Local,
    /// Distributed without waiting for acknowledgement
    DistributedNoAck,
    /// Distributed, waits for every peer to apply the update
    #[default]
    DistributedAck,
    /// Distributed, every update serialized through the entry's distributed lock
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "LOCAL",
            Scope::DistributedNoAck => "DISTRIBUTED_NO_ACK",
            Scope::DistributedAck => "DISTRIBUTED_ACK",
            Scope::Global => "GLOBAL",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Scope::Local)
    }

    pub fn is_distributed(&self) -> bool {
        !self.is_local()
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// Whether a distributed update waits for peers before returning
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Scope::DistributedAck | Scope::Global)
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "LOCAL" => Ok(Scope::Local),
            "DISTRIBUTED_NO_ACK" => Ok(Scope::DistributedNoAck),
            "DISTRIBUTED_ACK" => Ok(Scope::DistributedAck),
            "GLOBAL" => Ok(Scope::Global),
            _ => Err(format!("Invalid scope: {}", s)),
        }
    }
}

/// How a member stores the entries of a region it hosts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataPolicy {
    /// No local storage; every read is satisfied by peers or the loader
    Empty,
    /// Stores what is written or fetched locally; peer updates are applied
    /// only to entries already held
    #[default]
    Normal,
    /// Accepts every value distributed by peers
    Preloaded,
    /// Keeps a full copy of every distributed update
    Replicate,
}

impl DataPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataPolicy::Empty => "EMPTY",
            DataPolicy::Normal => "NORMAL",
            DataPolicy::Preloaded => "PRELOADED",
            DataPolicy::Replicate => "REPLICATE",
        }
    }

    pub fn with_storage(&self) -> bool {
        !matches!(self, DataPolicy::Empty)
    }

    /// Whether peer updates create entries that are not held locally
    pub fn accepts_all_updates(&self) -> bool {
        matches!(self, DataPolicy::Preloaded | DataPolicy::Replicate)
    }
}

impl Display for DataPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DataPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EMPTY" => Ok(DataPolicy::Empty),
            "NORMAL" => Ok(DataPolicy::Normal),
            "PRELOADED" => Ok(DataPolicy::Preloaded),
            "REPLICATE" => Ok(DataPolicy::Replicate),
            _ => Err(format!("Invalid data policy: {}", s)),
        }
    }
}
