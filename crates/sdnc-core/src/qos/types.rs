//! QoS policy types.

use crate::classify::ClassifiedPacket;
use crate::error::ValidationError;
use sdnc_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admission tier. Ordered so that `Critical` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Critical,
        PriorityTier::High,
        PriorityTier::Medium,
        PriorityTier::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            PriorityTier::Low => 0,
            PriorityTier::Medium => 1,
            PriorityTier::High => 2,
            PriorityTier::Critical => 3,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityTier::Low => write!(f, "low"),
            PriorityTier::Medium => write!(f, "medium"),
            PriorityTier::High => write!(f, "high"),
            PriorityTier::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(PriorityTier::Low),
            "medium" => Ok(PriorityTier::Medium),
            "high" => Ok(PriorityTier::High),
            "critical" => Ok(PriorityTier::Critical),
            _ => Err(format!("Unknown priority tier: {}", s)),
        }
    }
}

/// Inclusive L4 port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.start > self.end {
            return Err(ValidationError::InvalidPortRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Which traffic a QoS policy governs. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrafficSelector {
    pub ether_type: Option<u16>,
    pub source: Option<IpPrefix>,
    pub destination: Option<IpPrefix>,
    /// IP protocol number.
    pub protocol: Option<u8>,
    pub source_ports: Option<PortRange>,
    pub dest_ports: Option<PortRange>,
    /// Switch port the traffic leaves through.
    pub egress_port: Option<u32>,
}

fn both<T, F>(a: &Option<T>, b: &Option<T>, f: F) -> bool
where
    F: FnOnce(&T, &T) -> bool,
{
    match (a, b) {
        (Some(a), Some(b)) => f(a, b),
        _ => true,
    }
}

fn field<T, V, F>(want: &Option<T>, have: Option<V>, f: F) -> bool
where
    F: FnOnce(&T, V) -> bool,
{
    match (want, have) {
        (None, _) => true,
        (Some(w), Some(h)) => f(w, h),
        (Some(_), None) => false,
    }
}

impl TrafficSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = Some(ether_type);
        self
    }

    pub fn with_source(mut self, prefix: IpPrefix) -> Self {
        self.source = Some(prefix);
        self
    }

    pub fn with_destination(mut self, prefix: IpPrefix) -> Self {
        self.destination = Some(prefix);
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_source_ports(mut self, range: PortRange) -> Self {
        self.source_ports = Some(range);
        self
    }

    pub fn with_dest_ports(mut self, range: PortRange) -> Self {
        self.dest_ports = Some(range);
        self
    }

    pub fn with_egress_port(mut self, port: u32) -> Self {
        self.egress_port = Some(port);
        self
    }

    pub fn matches(&self, packet: &ClassifiedPacket, egress_port: u32) -> bool {
        field(&self.ether_type, Some(packet.ether_type), |w, h| *w == h)
            && field(&self.source, packet.source_addr, |w, h| w.contains(&h))
            && field(&self.destination, packet.dest_addr, |w, h| w.contains(&h))
            && field(&self.protocol, packet.transport_protocol.ip_proto(), |w, h| *w == h)
            && field(&self.source_ports, packet.source_port, |w, h| w.contains(h))
            && field(&self.dest_ports, packet.dest_port, |w, h| w.contains(h))
            && field(&self.egress_port, Some(egress_port), |w, h| *w == h)
    }

    /// Whether some packet could match both selectors.
    pub fn overlaps(&self, other: &TrafficSelector) -> bool {
        both(&self.ether_type, &other.ether_type, |a, b| a == b)
            && both(&self.source, &other.source, |a, b| a.overlaps(b))
            && both(&self.destination, &other.destination, |a, b| a.overlaps(b))
            && both(&self.protocol, &other.protocol, |a, b| a == b)
            && both(&self.source_ports, &other.source_ports, |a, b| a.overlaps(b))
            && both(&self.dest_ports, &other.dest_ports, |a, b| a.overlaps(b))
            && both(&self.egress_port, &other.egress_port, |a, b| a == b)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(range) = &self.source_ports {
            range.validate()?;
        }
        if let Some(range) = &self.dest_ports {
            range.validate()?;
        }
        Ok(())
    }
}

/// Admission policy for the traffic a selector picks out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosPolicy {
    pub priority_tier: PriorityTier,
    /// Unset = unmetered.
    #[serde(default)]
    pub bandwidth_ceiling_mbps: Option<f64>,
    #[serde(default)]
    pub selector: TrafficSelector,
}

impl QosPolicy {
    pub fn new(priority_tier: PriorityTier, selector: TrafficSelector) -> Self {
        Self {
            priority_tier,
            bandwidth_ceiling_mbps: None,
            selector,
        }
    }

    pub fn with_ceiling(mut self, mbps: f64) -> Self {
        self.bandwidth_ceiling_mbps = Some(mbps);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(ceiling) = self.bandwidth_ceiling_mbps {
            if !ceiling.is_finite() || ceiling <= 0.0 {
                return Err(ValidationError::InvalidCeiling(ceiling));
            }
        }
        self.selector.validate()
    }
}
