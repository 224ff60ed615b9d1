use crate::error::ParseError;
use crate::flow::{Flow, FlowClassifier, Subflow};
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;

pub const CONNTRACK_PATH: &str = "/proc/net/nf_conntrack";

#[derive(Default)]
struct SubflowFields {
    source: Option<IpAddr>,
    destination: Option<IpAddr>,
    source_port: u16,
    destination_port: u16,
    bytes: u64,
    packets: u64,
}

impl SubflowFields {
    fn build(self, line: &str) -> Result<Subflow, ParseError> {
        let missing = |field| ParseError::MissingField {
            field,
            line: line.to_string(),
        };
        Ok(Subflow {
            source: self.source.ok_or_else(|| missing("src"))?,
            destination: self.destination.ok_or_else(|| missing("dst"))?,
            source_port: self.source_port,
            destination_port: self.destination_port,
            bytes: self.bytes,
            packets: self.packets,
        })
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, ParseError> {
    value
        .parse::<T>()
        .map_err(|_| ParseError::InvalidNumber(value.to_string()))
}

/// Parse one conntrack entry:
/// `ipv4 2 tcp 6 431999 ESTABLISHED src=.. dst=.. sport=.. dport=.. [packets=.. bytes=..] src=.. ...`
///
/// The first tuple is the original direction, the second the reply.
pub fn parse_conntrack_line(line: &str) -> Result<Flow, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return Err(ParseError::ShortLine {
            expected: 5,
            line: line.to_string(),
        });
    }

    let protocol = parts[2].to_string();
    let ttl = parse_number::<u64>(parts[4])?;

    let mut rest = &parts[5..];
    let state = match rest.first() {
        Some(token) if !token.contains('=') && !token.starts_with('[') => {
            rest = &rest[1..];
            Some(token.to_string())
        }
        _ => None,
    };

    let mut tuples = [SubflowFields::default(), SubflowFields::default()];
    let mut current: Option<usize> = None;

    for token in rest {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if key == "src" {
            current = match current {
                None => Some(0),
                Some(0) => Some(1),
                // Tuples beyond the reply (e.g. expectations) are ignored
                Some(_) => break,
            };
        }
        let Some(index) = current else { continue };
        let tuple = &mut tuples[index];
        match key {
            "src" => {
                tuple.source = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::InvalidAddress(value.to_string()))?,
                )
            }
            "dst" => {
                tuple.destination = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::InvalidAddress(value.to_string()))?,
                )
            }
            "sport" => tuple.source_port = parse_number(value)?,
            "dport" => tuple.destination_port = parse_number(value)?,
            "packets" => tuple.packets = parse_number(value)?,
            "bytes" => tuple.bytes = parse_number(value)?,
            _ => {}
        }
    }

    let [original, reply] = tuples;
    Ok(Flow {
        protocol,
        state,
        ttl,
        original: original.build(line)?,
        reply: reply.build(line)?,
    })
}

/// Parse a whole conntrack dump, malformed lines are skipped
pub fn parse_conntrack(content: &str) -> Vec<Flow> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_conntrack_line(line) {
            Ok(flow) => Some(flow),
            Err(e) => {
                log::debug!("Skipping conntrack line: {}", e);
                None
            }
        })
        .collect()
}

/// Current flows worth showing, unordered
pub fn dump_flows(path: &str, classifier: &FlowClassifier) -> Result<Vec<Flow>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let flows: Vec<Flow> = parse_conntrack(&content)
        .into_iter()
        .filter(|f| classifier.is_of_interest(f))
        .collect();
    log::debug!("Read {} interesting flows from {}", flows.len(), path);
    Ok(flows)
}
