#[cfg(feature = "serde")]
extern crate serde;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One row of the client statistics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClientStat {
    pub ip: String,           // Client IP address
    pub name: String,         // Hostname or alias
    pub hwaddr: String,       // Hardware address, empty until an ARP entry is seen
    pub in_rate: f64,         // Inbound rate (bytes/second)
    pub out_rate: f64,        // Outbound rate (bytes/second)
    pub manufacturer: String, // Vendor resolved from hwaddr, filled in by the caller
}

/// NAT topology of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FlowClass {
    SelfNat,
    DestinationNat,
    Local,
    Routed,
}

impl FlowClass {
    pub const ALL: [FlowClass; 4] = [
        FlowClass::SelfNat,
        FlowClass::DestinationNat,
        FlowClass::Local,
        FlowClass::Routed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowClass::SelfNat => "self_nat",
            FlowClass::DestinationNat => "destination_nat",
            FlowClass::Local => "local",
            FlowClass::Routed => "routed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FlowClass::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// One direction of a tracked connection
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubflowRecord {
    pub src: String,
    pub dst: String,
    pub sport: u16,
    pub dport: u16,
    pub bytes: u64,
    pub packets: u64,
}

/// One row of the connection tracking snapshot
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowRecord {
    pub protocol: String,
    pub state: Option<String>,
    pub ttl: u64, // Seconds until conntrack expires the entry
    pub original: SubflowRecord,
    pub reply: SubflowRecord,
    pub classes: Vec<FlowClass>,
}
