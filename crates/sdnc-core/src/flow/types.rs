//! Flow rule model: match fields, matchers, actions and rules.

use crate::classify::ClassifiedPacket;
use crate::config::RuleLimits;
use crate::error::ValidationError;
use sdnc_types::{IpAddress, IpPrefix, MacAddress};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Highest physical port number a rule may output to.
pub const MAX_PORT: u32 = 0xffff_ff00;

/// Priority used by [`FlowRule::new`] callers that never set one.
pub const DEFAULT_PRIORITY: u16 = 32768;

/// Header field a rule can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchField {
    InPort,
    EthType,
    SrcMac,
    DstMac,
    SrcAddr,
    DstAddr,
    IpProto,
    SrcPort,
    DstPort,
    VlanId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Int { max: u64 },
    Mac,
    Ip,
}

impl MatchField {
    fn kind(self) -> FieldKind {
        match self {
            MatchField::InPort => FieldKind::Int {
                max: u64::from(MAX_PORT),
            },
            MatchField::EthType => FieldKind::Int { max: 0xffff },
            MatchField::IpProto => FieldKind::Int { max: 0xff },
            MatchField::SrcPort | MatchField::DstPort => FieldKind::Int { max: 0xffff },
            MatchField::VlanId => FieldKind::Int { max: 0x0fff },
            MatchField::SrcMac | MatchField::DstMac => FieldKind::Mac,
            MatchField::SrcAddr | MatchField::DstAddr => FieldKind::Ip,
        }
    }

    /// Fields a `SetField` action may rewrite.
    pub fn is_rewritable(self) -> bool {
        !matches!(
            self,
            MatchField::InPort | MatchField::EthType | MatchField::IpProto
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchField::InPort => "inPort",
            MatchField::EthType => "ethType",
            MatchField::SrcMac => "srcMac",
            MatchField::DstMac => "dstMac",
            MatchField::SrcAddr => "srcAddr",
            MatchField::DstAddr => "dstAddr",
            MatchField::IpProto => "ipProto",
            MatchField::SrcPort => "srcPort",
            MatchField::DstPort => "dstPort",
            MatchField::VlanId => "vlanId",
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inPort" => Ok(MatchField::InPort),
            "ethType" => Ok(MatchField::EthType),
            "srcMac" => Ok(MatchField::SrcMac),
            "dstMac" => Ok(MatchField::DstMac),
            "srcAddr" => Ok(MatchField::SrcAddr),
            "dstAddr" | "destAddr" => Ok(MatchField::DstAddr),
            "ipProto" => Ok(MatchField::IpProto),
            "srcPort" => Ok(MatchField::SrcPort),
            "dstPort" | "destPort" => Ok(MatchField::DstPort),
            "vlanId" => Ok(MatchField::VlanId),
            _ => Err(ValidationError::UnknownField(s.to_string())),
        }
    }
}

/// A concrete header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    Int(u64),
    Mac(MacAddress),
    Ip(IpAddress),
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::Int(v) => write!(f, "{}", v),
            MatchValue::Mac(m) => write!(f, "{}", m),
            MatchValue::Ip(a) => write!(f, "{}", a),
        }
    }
}

impl From<IpAddress> for MatchValue {
    fn from(addr: IpAddress) -> Self {
        MatchValue::Ip(addr)
    }
}

impl From<MacAddress> for MatchValue {
    fn from(mac: MacAddress) -> Self {
        MatchValue::Mac(mac)
    }
}

fn parse_int(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn check_value(field: MatchField, value: &MatchValue) -> Result<(), ValidationError> {
    let ok = match (field.kind(), value) {
        (FieldKind::Int { max }, MatchValue::Int(v)) => *v <= max,
        (FieldKind::Mac, MatchValue::Mac(_)) => true,
        (FieldKind::Ip, MatchValue::Ip(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue {
            field,
            value: value.to_string(),
        })
    }
}

/// How a rule matches one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Matcher {
    Exact(MatchValue),
    Wildcard,
    /// IP network; only valid on address fields.
    Prefix(IpPrefix),
    /// Inclusive numeric range; only valid on integer fields.
    Range { min: u64, max: u64 },
}

impl Matcher {
    /// Parses the textual form: `*`, `a.b.c.d/len`, `lo-hi` or a literal.
    pub fn parse(field: MatchField, text: &str) -> Result<Matcher, ValidationError> {
        let text = text.trim();
        let invalid = || ValidationError::InvalidValue {
            field,
            value: text.to_string(),
        };

        if text == "*" {
            return Ok(Matcher::Wildcard);
        }

        let matcher = match field.kind() {
            FieldKind::Ip if text.contains('/') => {
                Matcher::Prefix(text.parse().map_err(|_| invalid())?)
            }
            FieldKind::Ip => Matcher::Exact(MatchValue::Ip(text.parse().map_err(|_| invalid())?)),
            FieldKind::Mac => {
                Matcher::Exact(MatchValue::Mac(text.parse().map_err(|_| invalid())?))
            }
            FieldKind::Int { .. } => match text.split_once('-') {
                Some((lo, hi)) => Matcher::Range {
                    min: parse_int(lo.trim()).ok_or_else(invalid)?,
                    max: parse_int(hi.trim()).ok_or_else(invalid)?,
                },
                None => Matcher::Exact(MatchValue::Int(parse_int(text).ok_or_else(invalid)?)),
            },
        };

        matcher.validate(field)?;
        Ok(matcher)
    }

    pub fn validate(&self, field: MatchField) -> Result<(), ValidationError> {
        match self {
            Matcher::Wildcard => Ok(()),
            Matcher::Exact(value) => check_value(field, value),
            Matcher::Prefix(_) => match field.kind() {
                FieldKind::Ip => Ok(()),
                _ => Err(ValidationError::MatcherKind {
                    field,
                    reason: "prefix matchers apply to address fields only".to_string(),
                }),
            },
            Matcher::Range { min, max } => match field.kind() {
                FieldKind::Int { max: limit } if min <= max && *max <= limit => Ok(()),
                FieldKind::Int { .. } => Err(ValidationError::InvalidRange {
                    field,
                    min: *min,
                    max: *max,
                }),
                _ => Err(ValidationError::MatcherKind {
                    field,
                    reason: "range matchers apply to numeric fields only".to_string(),
                }),
            },
        }
    }

    /// Folds equivalent spellings onto one form: a host prefix is an exact
    /// address, a single-value range is an exact value.
    fn canonical(&self) -> Matcher {
        match *self {
            Matcher::Prefix(p) if p.is_host_route() => Matcher::Exact(MatchValue::Ip(*p.address())),
            Matcher::Range { min, max } if min == max => Matcher::Exact(MatchValue::Int(min)),
            other => other,
        }
    }

    /// Whether a packet carrying `value` (or lacking the field) is accepted.
    pub fn accepts(&self, value: Option<MatchValue>) -> bool {
        match (self, value) {
            (Matcher::Wildcard, _) => true,
            (Matcher::Exact(expected), Some(actual)) => *expected == actual,
            (Matcher::Prefix(prefix), Some(MatchValue::Ip(addr))) => prefix.contains(&addr),
            (Matcher::Range { min, max }, Some(MatchValue::Int(v))) => (*min..=*max).contains(&v),
            _ => false,
        }
    }
}

/// Ordered field → matcher mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowMatch(BTreeMap<MatchField, Matcher>);

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a match from textual `(field, value)` pairs.
    ///
    /// ```
    /// use sdnc_core::flow::FlowMatch;
    ///
    /// let m = FlowMatch::parse([("destAddr", "172.16.0.0/16"), ("dstPort", "80-89")]).unwrap();
    /// assert_eq!(m.len(), 2);
    /// ```
    pub fn parse<'a, I>(pairs: I) -> Result<FlowMatch, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut flow_match = FlowMatch::new();
        for (name, value) in pairs {
            let field: MatchField = name.parse()?;
            flow_match.0.insert(field, Matcher::parse(field, value)?);
        }
        Ok(flow_match)
    }

    pub fn with(mut self, field: MatchField, matcher: Matcher) -> Self {
        self.0.insert(field, matcher);
        self
    }

    pub fn with_exact(self, field: MatchField, value: impl Into<MatchValue>) -> Self {
        self.with(field, Matcher::Exact(value.into()))
    }

    pub fn get(&self, field: MatchField) -> Option<&Matcher> {
        self.0.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MatchField, &Matcher)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::EmptyMatch);
        }
        for (field, matcher) in &self.0 {
            matcher.validate(*field)?;
        }
        Ok(())
    }

    /// Form used for duplicate detection. Wildcards are dropped since they
    /// match the same traffic as an absent field.
    pub fn canonical(&self) -> FlowMatch {
        FlowMatch(
            self.0
                .iter()
                .filter(|(_, m)| !matches!(m, Matcher::Wildcard))
                .map(|(f, m)| (*f, m.canonical()))
                .collect(),
        )
    }

    pub fn matches(&self, packet: &ClassifiedPacket) -> bool {
        self.0
            .iter()
            .all(|(field, matcher)| matcher.accepts(packet.field(*field)))
    }

    /// Destination network this match is bound to, if any.
    pub fn destination(&self) -> Option<IpPrefix> {
        match self.0.get(&MatchField::DstAddr)? {
            Matcher::Exact(MatchValue::Ip(addr)) => Some(IpPrefix::host(*addr)),
            Matcher::Prefix(prefix) => Some(*prefix),
            _ => None,
        }
    }
}

/// One step of a rule's action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Output { port: u32 },
    SetField { field: MatchField, value: MatchValue },
    Drop,
}

impl Action {
    pub const fn output(port: u32) -> Self {
        Action::Output { port }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Action::Output { port } if *port == 0 || *port > MAX_PORT => {
                Err(ValidationError::InvalidPort(*port))
            }
            Action::SetField { field, .. } if !field.is_rewritable() => {
                Err(ValidationError::FieldNotRewritable(*field))
            }
            Action::SetField { field, value } => check_value(*field, value),
            _ => Ok(()),
        }
    }
}

/// One flow table entry as requested by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRule {
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
    /// Unset means the configured default priority.
    pub priority: Option<u16>,
    pub table_id: u8,
    pub idle_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
    pub cookie: u64,
}

impl FlowRule {
    pub fn new(flow_match: FlowMatch) -> Self {
        Self {
            flow_match,
            actions: Vec::new(),
            priority: None,
            table_id: 0,
            idle_timeout: None,
            hard_timeout: None,
            cookie: 0,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_table(mut self, table_id: u8) -> Self {
        self.table_id = table_id;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    /// Validates the rule and returns its effective priority.
    pub fn validate(&self, limits: &RuleLimits, default_priority: u16) -> Result<u16, ValidationError> {
        self.flow_match.validate()?;

        if self.actions.is_empty() {
            return Err(ValidationError::EmptyActions);
        }
        if self.actions.len() > 1 && self.actions.contains(&Action::Drop) {
            return Err(ValidationError::DropNotAlone);
        }
        for action in &self.actions {
            action.validate()?;
        }

        let priority = self.priority.unwrap_or(default_priority);
        if priority < limits.min_priority || priority > limits.max_priority {
            return Err(ValidationError::PriorityOutOfRange {
                priority,
                min: limits.min_priority,
                max: limits.max_priority,
            });
        }
        if self.table_id > limits.max_table_id {
            return Err(ValidationError::TableIdOutOfRange {
                table_id: self.table_id,
                max: limits.max_table_id,
            });
        }
        Ok(priority)
    }

    pub fn is_drop(&self) -> bool {
        self.actions == [Action::Drop]
    }
}

/// Identity under which two active rules on a switch conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RuleKey {
    flow_match: FlowMatch,
    table_id: u8,
    priority: u16,
}

impl RuleKey {
    pub(crate) fn new(rule: &FlowRule, priority: u16) -> Self {
        Self {
            flow_match: rule.flow_match.canonical(),
            table_id: rule.table_id,
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_field_names() {
        assert_eq!("destAddr".parse::<MatchField>().unwrap(), MatchField::DstAddr);
        assert_eq!("dstAddr".parse::<MatchField>().unwrap(), MatchField::DstAddr);
        assert_eq!("destPort".parse::<MatchField>().unwrap(), MatchField::DstPort);
        assert_eq!(MatchField::InPort.to_string(), "inPort");
        assert!(matches!(
            "color".parse::<MatchField>(),
            Err(ValidationError::UnknownField(_))
        ));
    }

    #[test]
    fn test_matcher_parse() {
        assert_eq!(Matcher::parse(MatchField::SrcPort, "*").unwrap(), Matcher::Wildcard);
        assert_eq!(
            Matcher::parse(MatchField::DstAddr, "10.1.2.3/16").unwrap(),
            Matcher::Prefix("10.1.0.0/16".parse().unwrap())
        );
        assert_eq!(
            Matcher::parse(MatchField::DstPort, "1000-2000").unwrap(),
            Matcher::Range { min: 1000, max: 2000 }
        );
        assert_eq!(
            Matcher::parse(MatchField::EthType, "0x0800").unwrap(),
            Matcher::Exact(MatchValue::Int(0x0800))
        );
        assert_eq!(
            Matcher::parse(MatchField::SrcMac, "00-11-22-33-44-55").unwrap(),
            Matcher::Exact(MatchValue::Mac("00:11:22:33:44:55".parse().unwrap()))
        );
    }

    #[test]
    fn test_matcher_parse_rejects_bad_values() {
        assert!(Matcher::parse(MatchField::DstAddr, "300.0.0.1").is_err());
        assert!(Matcher::parse(MatchField::DstPort, "70000").is_err());
        assert!(Matcher::parse(MatchField::DstPort, "90-80").is_err());
        assert!(Matcher::parse(MatchField::VlanId, "4096").is_err());
        assert!(Matcher::parse(MatchField::SrcPort, "10.0.0.0/8").is_err());
    }

    #[test]
    fn test_matcher_kind_mismatch() {
        let prefix = Matcher::Prefix("10.0.0.0/8".parse().unwrap());
        assert!(matches!(
            prefix.validate(MatchField::InPort),
            Err(ValidationError::MatcherKind { .. })
        ));
        let range = Matcher::Range { min: 1, max: 2 };
        assert!(range.validate(MatchField::SrcAddr).is_err());
        assert!(Matcher::Exact(MatchValue::Int(1)).validate(MatchField::DstMac).is_err());
    }

    #[test]
    fn test_matcher_accepts() {
        let prefix = Matcher::Prefix("172.16.0.0/16".parse().unwrap());
        assert!(prefix.accepts(Some(MatchValue::Ip(ip("172.16.9.9")))));
        assert!(!prefix.accepts(Some(MatchValue::Ip(ip("172.17.0.1")))));
        assert!(!prefix.accepts(None));

        let range = Matcher::Range { min: 80, max: 89 };
        assert!(range.accepts(Some(MatchValue::Int(80))));
        assert!(range.accepts(Some(MatchValue::Int(89))));
        assert!(!range.accepts(Some(MatchValue::Int(90))));

        assert!(Matcher::Wildcard.accepts(None));
    }

    #[test]
    fn test_canonical_drops_wildcards_and_folds_host_prefix() {
        let a = FlowMatch::new()
            .with_exact(MatchField::DstAddr, ip("172.16.0.1"))
            .with(MatchField::SrcPort, Matcher::Wildcard);
        let b = FlowMatch::new().with(
            MatchField::DstAddr,
            Matcher::Prefix("172.16.0.1/32".parse().unwrap()),
        );
        assert_ne!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_destination() {
        let exact = FlowMatch::new().with_exact(MatchField::DstAddr, ip("10.0.0.1"));
        assert_eq!(exact.destination(), Some("10.0.0.1/32".parse().unwrap()));
        let none = FlowMatch::new().with_exact(MatchField::InPort, MatchValue::Int(1));
        assert_eq!(none.destination(), None);
    }

    #[test]
    fn test_rule_validation() {
        let limits = RuleLimits::default();
        let m = FlowMatch::new().with_exact(MatchField::DstAddr, ip("10.0.0.1"));

        assert_eq!(
            FlowRule::new(FlowMatch::new())
                .with_action(Action::output(1))
                .validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::EmptyMatch)
        );
        assert_eq!(
            FlowRule::new(m.clone()).validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::EmptyActions)
        );
        assert_eq!(
            FlowRule::new(m.clone())
                .with_action(Action::Drop)
                .with_action(Action::output(2))
                .validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::DropNotAlone)
        );
        assert_eq!(
            FlowRule::new(m.clone())
                .with_action(Action::output(0))
                .validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::InvalidPort(0))
        );
        assert_eq!(
            FlowRule::new(m.clone())
                .with_action(Action::SetField {
                    field: MatchField::InPort,
                    value: MatchValue::Int(3),
                })
                .validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::FieldNotRewritable(MatchField::InPort))
        );
        assert_eq!(
            FlowRule::new(m.clone())
                .with_action(Action::output(1))
                .with_table(255)
                .validate(&limits, DEFAULT_PRIORITY),
            Err(ValidationError::TableIdOutOfRange { table_id: 255, max: 254 })
        );
        assert_eq!(
            FlowRule::new(m)
                .with_action(Action::output(1))
                .validate(&limits, DEFAULT_PRIORITY),
            Ok(DEFAULT_PRIORITY)
        );
    }

    #[test]
    fn test_priority_limits() {
        let limits = RuleLimits {
            min_priority: 10,
            max_priority: 1000,
            max_table_id: 4,
        };
        let rule = FlowRule::new(FlowMatch::new().with_exact(MatchField::InPort, MatchValue::Int(1)))
            .with_action(Action::output(2))
            .with_priority(5);
        assert!(matches!(
            rule.validate(&limits, 100),
            Err(ValidationError::PriorityOutOfRange { priority: 5, .. })
        ));
    }

    #[test]
    fn test_action_json_shape() {
        let json = serde_json::to_value(Action::output(2)).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "output", "port": 2 }));
        let json = serde_json::to_value(Action::Drop).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "drop" }));
    }

    #[test]
    fn test_zero_timeout_is_permanent() {
        let rule = FlowRule::new(FlowMatch::new()).with_idle_timeout(Duration::ZERO);
        assert_eq!(rule.idle_timeout, None);
    }
}
