use crate::error::ParseError;
use crate::monitor::ClientsModuleContext;
use anyhow::{Context, Result};
use std::fs;
use std::net::Ipv4Addr;

const ARP_TABLE_PATH: &str = "/proc/net/arp";

/// One row of /proc/net/arp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip_address: String,
    pub hw_type: String,
    pub flags: String,
    pub hw_address: String,
    pub mask: String,
    pub device: String,
}

impl ArpEntry {
    /// Flags 0x0 means the kernel has no resolved address yet
    pub fn is_complete(&self) -> bool {
        let flags = self.flags.trim_start_matches("0x");
        !(flags.chars().all(|c| c == '0') || self.hw_address == "00:00:00:00:00:00")
    }
}

// IP address       HW type     Flags       HW address            Mask     Device
fn parse_arp_line(line: &str) -> Result<ArpEntry, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return Err(ParseError::ShortLine {
            expected: 6,
            line: line.to_string(),
        });
    }

    if parts[0].parse::<Ipv4Addr>().is_err() {
        return Err(ParseError::InvalidAddress(parts[0].to_string()));
    }

    Ok(ArpEntry {
        ip_address: parts[0].to_string(),
        hw_type: parts[1].to_string(),
        flags: parts[2].to_string(),
        hw_address: parts[3].to_lowercase(),
        mask: parts[4].to_string(),
        device: parts[5].to_string(),
    })
}

/// Parse the ARP table text, the first line is a header
pub fn parse_arp_table(content: &str) -> Vec<ArpEntry> {
    content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_arp_line(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::debug!("Skipping ARP line: {}", e);
                None
            }
        })
        .collect()
}

pub fn filter_device(entries: Vec<ArpEntry>, device: &str) -> Vec<ArpEntry> {
    entries.into_iter().filter(|e| e.device == device).collect()
}

/// Read the ARP entries of one interface
pub fn read_arp_table(device: &str) -> Result<Vec<ArpEntry>> {
    let content = fs::read_to_string(ARP_TABLE_PATH)
        .with_context(|| format!("Failed to read {}", ARP_TABLE_PATH))?;
    Ok(filter_device(parse_arp_table(&content), device))
}

/// Keeps client hardware addresses current from the ARP table
pub struct ArpMonitor;

impl ArpMonitor {
    pub fn new() -> Self {
        ArpMonitor
    }

    pub async fn start(
        &self,
        ctx: &ClientsModuleContext,
        shutdown_notify: std::sync::Arc<tokio::sync::Notify>,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(ctx.options.arp_delay());
        let shutdown = shutdown_notify.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh(ctx) {
                        log::error!("Failed to refresh ARP entries: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    log::info!("ARP monitoring module received shutdown signal, stopping...");
                    break;
                }
            }
        }

        Ok(())
    }

    fn refresh(&self, ctx: &ClientsModuleContext) -> Result<()> {
        let entries = read_arp_table(ctx.options.lan_if())?;
        let count = ctx.registry.ingest_arp(
            entries
                .into_iter()
                .filter(ArpEntry::is_complete)
                .map(|e| (e.ip_address, e.hw_address)),
        );
        log::debug!("ARP refresh: {} entries on {}", count, ctx.options.lan_if());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP_TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.20     0x1         0x2         00:11:22:33:44:55     *        br0
192.168.1.21     0x1         0x2         AA:BB:CC:DD:EE:FF     *        br0
192.168.1.22     0x1         0x0         00:00:00:00:00:00     *        br0
203.0.113.1      0x1         0x2         66:77:88:99:aa:bb     *        wan
broken line
";

    #[test]
    fn test_parse_arp_table() {
        let entries = parse_arp_table(ARP_TABLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            ArpEntry {
                ip_address: "192.168.1.20".to_string(),
                hw_type: "0x1".to_string(),
                flags: "0x2".to_string(),
                hw_address: "00:11:22:33:44:55".to_string(),
                mask: "*".to_string(),
                device: "br0".to_string(),
            }
        );
        assert_eq!(entries[1].hw_address, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_filter_device() {
        let entries = filter_device(parse_arp_table(ARP_TABLE), "br0");
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.device == "br0"));

        let complete: Vec<_> = entries.iter().filter(|e| e.is_complete()).collect();
        assert_eq!(complete.len(), 2);
    }

    #[test]
    fn test_short_line() {
        assert_eq!(
            parse_arp_line("192.168.1.1 0x1"),
            Err(ParseError::ShortLine {
                expected: 6,
                line: "192.168.1.1 0x1".to_string()
            })
        );
        assert!(matches!(
            parse_arp_line("nope 0x1 0x2 00:11:22:33:44:55 * br0"),
            Err(ParseError::InvalidAddress(_))
        ));
    }
}
