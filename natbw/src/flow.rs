use crate::utils::network_utils::is_ipv6_link_local;
use natbw_common::{FlowClass, FlowRecord, SubflowRecord};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv6Addr};

/// One direction of a tracked connection
#[derive(Debug, Clone, PartialEq)]
pub struct Subflow {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    pub bytes: u64,
    pub packets: u64,
}

impl Subflow {
    #[cfg(test)]
    pub fn new(source: IpAddr, destination: IpAddr) -> Self {
        Self {
            source,
            destination,
            source_port: 0,
            destination_port: 0,
            bytes: 0,
            packets: 0,
        }
    }

    fn to_record(&self) -> SubflowRecord {
        SubflowRecord {
            src: self.source.to_string(),
            dst: self.destination.to_string(),
            sport: self.source_port,
            dport: self.destination_port,
            bytes: self.bytes,
            packets: self.packets,
        }
    }
}

/// A connection tracking entry
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub protocol: String,
    pub state: Option<String>,
    pub ttl: u64,
    pub original: Subflow,
    pub reply: Subflow,
}

impl Flow {
    fn addresses(&self) -> [IpAddr; 4] {
        [
            self.original.source,
            self.original.destination,
            self.reply.source,
            self.reply.destination,
        ]
    }

    pub fn involves(&self, ip: &IpAddr) -> bool {
        self.addresses().contains(ip)
    }
}

pub type FlowClasses = BTreeSet<FlowClass>;

/// Addresses configured on this host, captured once at startup
#[derive(Debug, Clone, Default)]
pub struct LocalAddrs {
    addrs: HashSet<IpAddr>,
}

impl LocalAddrs {
    pub fn new<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addrs.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}

/// NAT topology classification of flows against the host's own addresses
#[derive(Debug, Clone)]
pub struct FlowClassifier {
    local: LocalAddrs,
}

impl FlowClassifier {
    pub fn new(local: LocalAddrs) -> Self {
        Self { local }
    }

    /// Classes of a flow, possibly none.
    ///
    /// `os`/`od` are the original source/destination and `rs`/`rd` the reply
    /// source/destination. A flow with `os != rd && od == rs` is either
    /// `SelfNat` or `DestinationNat`, never both.
    pub fn classify(&self, flow: &Flow) -> FlowClasses {
        let os = flow.original.source;
        let od = flow.original.destination;
        let rs = flow.reply.source;
        let rd = flow.reply.destination;

        let mut classes = FlowClasses::new();

        if os == rd && od == rs {
            if flow.addresses().iter().any(|ip| self.local.contains(ip)) {
                classes.insert(FlowClass::Local);
            } else {
                classes.insert(FlowClass::Routed);
            }
        }

        // Source rewritten: replies come back to a different address
        if os != rd && od == rs {
            if self.local.contains(&rd) {
                classes.insert(FlowClass::SelfNat);
            } else {
                classes.insert(FlowClass::DestinationNat);
            }
        }

        if (os == rd && od != rs) || (os != rd && od != rs && od == rd) {
            classes.insert(FlowClass::DestinationNat);
        }

        classes
    }

    /// False when every endpoint is the host itself or a similarly
    /// uninteresting address. Multicast is kept.
    pub fn is_of_interest(&self, flow: &Flow) -> bool {
        flow.addresses().iter().any(|ip| {
            !(ip.is_unspecified()
                || ip.is_loopback()
                || is_link_local_unicast(ip)
                || self.local.contains(ip))
        })
    }

    pub fn to_record(&self, flow: &Flow) -> FlowRecord {
        FlowRecord {
            protocol: flow.protocol.clone(),
            state: flow.state.clone(),
            ttl: flow.ttl,
            original: flow.original.to_record(),
            reply: flow.reply.to_record(),
            classes: self.classify(flow).into_iter().collect(),
        }
    }
}

fn is_link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => is_ipv6_link_local(v6),
    }
}

pub fn filter_by_ip(flows: Vec<Flow>, ip: &IpAddr) -> Vec<Flow> {
    flows.into_iter().filter(|f| f.involves(ip)).collect()
}

pub fn filter_by_class(
    flows: Vec<Flow>,
    class: FlowClass,
    classifier: &FlowClassifier,
) -> Vec<Flow> {
    flows
        .into_iter()
        .filter(|f| classifier.classify(f).contains(&class))
        .collect()
}

/// Sort keys accepted by `order_by`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowOrder {
    Ttl,
    OrigSrc,
    OrigDst,
    ReplySrc,
    ReplyDst,
    OrigBytes,
    ReplyBytes,
    Proto,
    State,
}

impl FlowOrder {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ttl" => Some(FlowOrder::Ttl),
            "orig_src" => Some(FlowOrder::OrigSrc),
            "orig_dst" => Some(FlowOrder::OrigDst),
            "reply_src" => Some(FlowOrder::ReplySrc),
            "reply_dst" => Some(FlowOrder::ReplyDst),
            "orig_bytes" => Some(FlowOrder::OrigBytes),
            "reply_bytes" => Some(FlowOrder::ReplyBytes),
            "proto" => Some(FlowOrder::Proto),
            "state" => Some(FlowOrder::State),
            _ => None,
        }
    }

    fn apply(self, flows: &mut [Flow]) {
        match self {
            FlowOrder::Ttl => flows.sort_by(|a, b| b.ttl.cmp(&a.ttl)),
            FlowOrder::OrigSrc => {
                flows.sort_by_key(|f| f.original.source_port);
                flows.sort_by(|a, b| cmp_ip(&a.original.source, &b.original.source));
            }
            FlowOrder::OrigDst => {
                flows.sort_by_key(|f| f.original.destination_port);
                flows.sort_by(|a, b| cmp_ip(&a.original.destination, &b.original.destination));
            }
            FlowOrder::ReplySrc => {
                flows.sort_by_key(|f| f.reply.source_port);
                flows.sort_by(|a, b| cmp_ip(&a.reply.source, &b.reply.source));
            }
            FlowOrder::ReplyDst => {
                flows.sort_by_key(|f| f.reply.destination_port);
                flows.sort_by(|a, b| cmp_ip(&a.reply.destination, &b.reply.destination));
            }
            FlowOrder::OrigBytes => flows.sort_by(|a, b| b.original.bytes.cmp(&a.original.bytes)),
            FlowOrder::ReplyBytes => flows.sort_by(|a, b| b.reply.bytes.cmp(&a.reply.bytes)),
            FlowOrder::Proto => flows.sort_by(|a, b| b.protocol.cmp(&a.protocol)),
            FlowOrder::State => flows.sort_by(|a, b| b.state.cmp(&a.state)),
        }
    }
}

/// Stable multi-key sort, the first key has the highest priority.
/// Unknown keys are ignored.
pub fn order_by<S: AsRef<str>>(flows: &mut [Flow], keys: &[S]) {
    for key in keys.iter().rev() {
        match FlowOrder::from_name(key.as_ref()) {
            Some(order) => order.apply(flows),
            None => log::debug!("Ignoring unknown conntrack order key '{}'", key.as_ref()),
        }
    }
}

// Byte order over the 16 byte form, so IPv4 sorts as ::ffff:a.b.c.d
fn cmp_ip(a: &IpAddr, b: &IpAddr) -> Ordering {
    as_v6(a).octets().cmp(&as_v6(b).octets())
}

fn as_v6(ip: &IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn flow(os: &str, od: &str, rs: &str, rd: &str) -> Flow {
        Flow {
            protocol: "tcp".to_string(),
            state: Some("ESTABLISHED".to_string()),
            ttl: 100,
            original: Subflow::new(ip(os), ip(od)),
            reply: Subflow::new(ip(rs), ip(rd)),
        }
    }

    fn classifier(local: &[&str]) -> FlowClassifier {
        FlowClassifier::new(LocalAddrs::new(local.iter().map(|s| ip(s))))
    }

    #[test]
    fn test_local_flow() {
        let c = classifier(&["10.0.0.5"]);
        let f = flow("10.0.0.5", "8.8.8.8", "8.8.8.8", "10.0.0.5");
        let classes = c.classify(&f);
        assert!(classes.contains(&FlowClass::Local));
        assert!(!classes.contains(&FlowClass::Routed));
        assert!(c.is_of_interest(&f));
    }

    #[test]
    fn test_destination_nat_without_local_addresses() {
        let c = classifier(&["192.168.1.1"]);
        let f = flow("10.0.0.7", "198.51.100.1", "198.51.100.1", "203.0.113.9");
        let classes = c.classify(&f);
        assert_eq!(classes, FlowClasses::from([FlowClass::DestinationNat]));
    }

    #[test]
    fn test_self_nat() {
        // Masquerade: replies go to the router's WAN address
        let c = classifier(&["192.168.1.1", "203.0.113.7"]);
        let f = flow("192.168.1.20", "1.1.1.1", "1.1.1.1", "203.0.113.7");
        assert_eq!(c.classify(&f), FlowClasses::from([FlowClass::SelfNat]));
    }

    #[test]
    fn test_port_forward_is_destination_nat() {
        let c = classifier(&["203.0.113.7"]);
        let f = flow("198.51.100.4", "203.0.113.7", "192.168.1.50", "198.51.100.4");
        assert_eq!(c.classify(&f), FlowClasses::from([FlowClass::DestinationNat]));

        // Reply addressed to the original destination
        let f = flow("198.51.100.4", "192.168.1.50", "192.168.1.60", "192.168.1.50");
        assert_eq!(c.classify(&f), FlowClasses::from([FlowClass::DestinationNat]));
    }

    #[test]
    fn test_routed_flow() {
        let c = classifier(&["192.168.1.1"]);
        let f = flow("192.168.2.10", "8.8.4.4", "8.8.4.4", "192.168.2.10");
        assert_eq!(c.classify(&f), FlowClasses::from([FlowClass::Routed]));
    }

    #[test]
    fn test_unclassified_flow() {
        let c = classifier(&[]);
        let f = flow("10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4");
        assert!(c.classify(&f).is_empty());
    }

    #[test]
    fn test_interest() {
        let c = classifier(&["192.168.1.1"]);
        assert!(!c.is_of_interest(&flow("127.0.0.1", "127.0.0.1", "127.0.0.1", "127.0.0.1")));
        assert!(!c.is_of_interest(&flow(
            "fe80::1",
            "192.168.1.1",
            "192.168.1.1",
            "fe80::1"
        )));
        assert!(!c.is_of_interest(&flow(
            "169.254.3.3",
            "0.0.0.0",
            "::",
            "192.168.1.1"
        )));
        // Multicast is kept
        assert!(c.is_of_interest(&flow(
            "192.168.1.1",
            "224.0.0.251",
            "224.0.0.251",
            "192.168.1.1"
        )));
    }

    #[test]
    fn test_filters() {
        let c = classifier(&["10.0.0.1"]);
        let flows = vec![
            flow("10.0.0.5", "8.8.8.8", "8.8.8.8", "10.0.0.5"),
            flow("10.0.0.6", "1.1.1.1", "1.1.1.1", "10.0.0.1"),
            flow("10.0.0.7", "9.9.9.9", "9.9.9.9", "10.0.0.7"),
        ];

        let by_ip = filter_by_ip(flows.clone(), &ip("1.1.1.1"));
        assert_eq!(by_ip.len(), 1);
        assert_eq!(by_ip[0].original.source, ip("10.0.0.6"));

        let self_nat = filter_by_class(flows.clone(), FlowClass::SelfNat, &c);
        assert_eq!(self_nat.len(), 1);
        let routed = filter_by_class(flows, FlowClass::Routed, &c);
        assert_eq!(routed.len(), 2);
    }

    #[test]
    fn test_order_by_priority() {
        let mut a = flow("10.0.0.2", "8.8.8.8", "8.8.8.8", "10.0.0.2");
        a.ttl = 10;
        let mut b = flow("10.0.0.1", "8.8.8.8", "8.8.8.8", "10.0.0.1");
        b.ttl = 10;
        let mut c = flow("10.0.0.1", "8.8.8.8", "8.8.8.8", "10.0.0.1");
        c.ttl = 50;
        c.original.source_port = 2000;
        b.original.source_port = 1000;

        let mut flows = vec![a.clone(), b.clone(), c.clone()];
        order_by(&mut flows, &["ttl", "orig_src"]);
        assert_eq!(flows, vec![c.clone(), b.clone(), a.clone()]);

        let mut flows = vec![a.clone(), c.clone(), b.clone()];
        order_by(&mut flows, &["orig_src", "ttl"]);
        assert_eq!(flows, vec![b.clone(), c.clone(), a.clone()]);

        // Unknown keys change nothing
        let mut flows = vec![a.clone(), c.clone(), b.clone()];
        order_by(&mut flows, &["bogus"]);
        assert_eq!(flows, vec![a, c, b]);
    }

    #[test]
    fn test_order_by_bytes_is_stable() {
        let mut flows: Vec<Flow> = (0..4)
            .map(|i| {
                let mut f = flow("10.0.0.1", "8.8.8.8", "8.8.8.8", "10.0.0.1");
                f.ttl = i;
                f.reply.bytes = if i % 2 == 0 { 100 } else { 500 };
                f
            })
            .collect();
        order_by(&mut flows, &["reply_bytes"]);
        let ttls: Vec<u64> = flows.iter().map(|f| f.ttl).collect();
        assert_eq!(ttls, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_to_record() {
        let c = classifier(&["10.0.0.5"]);
        let mut f = flow("10.0.0.5", "8.8.8.8", "8.8.8.8", "10.0.0.5");
        f.original.source_port = 40000;
        f.original.destination_port = 53;
        f.original.bytes = 120;
        let record = c.to_record(&f);
        assert_eq!(record.original.src, "10.0.0.5");
        assert_eq!(record.original.sport, 40000);
        assert_eq!(record.original.dport, 53);
        assert_eq!(record.original.bytes, 120);
        assert_eq!(record.classes, vec![FlowClass::Local]);
        assert_eq!(record.state.as_deref(), Some("ESTABLISHED"));
    }
}
