use crate::error::ParseError;
use crate::monitor::arp::{read_arp_table, ArpEntry};
use crate::monitor::ClientsModuleContext;
use crate::storage::clients::CounterRecord;
use crate::utils::format_utils::{format_bytes, format_rate};
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::process::Command;
use std::time::Instant;

const TABLE: &str = "filter";
const FORWARD: &str = "FORWARD";

/// Accounting chain jumped to from FORWARD.
///
/// Holds one `-d IP -j RETURN` and one `-s IP -j RETURN` rule per LAN
/// client, their counters are the per-client byte totals.
#[derive(Debug, Clone)]
pub struct IptablesChain {
    chain: String,
    lan_if: String,
}

impl IptablesChain {
    pub fn new(chain: &str, lan_if: &str) -> Self {
        Self {
            chain: chain.to_string(),
            lan_if: lan_if.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.chain
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("iptables")
            .arg("-t")
            .arg(TABLE)
            .args(args)
            .output()
            .context("Failed to execute iptables")?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // `-C` exits 1 when the rule is missing, other failures are errors too
    fn rule_exists(&self, chain: &str, rule: &[&str]) -> Result<bool> {
        let status = Command::new("iptables")
            .args(["-t", TABLE, "-C", chain])
            .args(rule)
            .output()
            .context("Failed to execute iptables")?
            .status;

        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow::anyhow!(
                "iptables -C {} {} failed: {}",
                chain,
                rule.join(" "),
                status
            )),
        }
    }

    fn chain_exists(&self) -> bool {
        self.run(&["-n", "-L", self.chain.as_str()]).is_ok()
    }

    /// Create the chain, or flush it when it already exists
    pub fn clear_chain(&self) -> Result<()> {
        if self.chain_exists() {
            self.run(&["-F", self.chain.as_str()])?;
        } else {
            self.run(&["-N", self.chain.as_str()])?;
        }
        Ok(())
    }

    /// Remove the FORWARD jump and the chain itself
    pub fn delete(&self) -> Result<()> {
        if !self.chain_exists() {
            log::debug!("Chain {} does not exist, nothing to delete", self.chain);
            return Ok(());
        }

        self.run(&["-F", self.chain.as_str()])?;

        let jump = ["-j", self.chain.as_str()];
        while self.rule_exists(FORWARD, &jump)? {
            self.run(&["-D", FORWARD, "-j", self.chain.as_str()])?;
        }

        self.run(&["-X", self.chain.as_str()])?;
        log::info!("Removed iptables chain {}", self.chain);
        Ok(())
    }

    /// Make sure FORWARD jumps to the chain and every LAN client has its rules
    pub fn update(&self) -> Result<usize> {
        let entries = read_arp_table(&self.lan_if)?;
        self.update_with(&entries)
    }

    fn update_with(&self, entries: &[ArpEntry]) -> Result<usize> {
        let jump = ["-j", self.chain.as_str()];
        if !self.rule_exists(FORWARD, &jump)? {
            self.run(&["-I", FORWARD, "1", "-j", self.chain.as_str()])?;
        }

        let mut added = 0;
        for entry in entries {
            for side in ["-d", "-s"] {
                let rule = [side, entry.ip_address.as_str(), "-j", "RETURN"];
                match self.append_unique(&rule) {
                    Ok(true) => added += 1,
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("Failed to add rule for {}: {}", entry.ip_address, e);
                        break;
                    }
                }
            }
        }

        if added > 0 {
            log::debug!("Added {} rules to chain {}", added, self.chain);
        }
        Ok(added)
    }

    fn append_unique(&self, rule: &[&str]) -> Result<bool> {
        if self.rule_exists(&self.chain, rule)? {
            return Ok(false);
        }
        let mut args = vec!["-A", self.chain.as_str()];
        args.extend_from_slice(rule);
        self.run(&args)?;
        Ok(true)
    }

    /// Current byte counters of every rule in the chain
    pub fn stats(&self) -> Result<Vec<CounterRecord>> {
        let output = self.run(&["-L", self.chain.as_str(), "-n", "-v", "-x"])?;
        Ok(parse_counters(&output))
    }
}

//     pkts      bytes target     prot opt in     out     source               destination
fn parse_counter_line(line: &str) -> Result<CounterRecord, ParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    // Some iptables versions leave the opt column empty
    let (source, destination) = match fields.len() {
        n if n >= 9 => (fields[7], fields[8]),
        8 => (fields[6], fields[7]),
        _ => {
            return Err(ParseError::ShortLine {
                expected: 9,
                line: line.to_string(),
            })
        }
    };

    let bytes = fields[1]
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidNumber(fields[1].to_string()))?;

    Ok(CounterRecord {
        source: parse_network_address(source)?,
        destination: parse_network_address(destination)?,
        bytes,
    })
}

// "192.168.1.20" or "0.0.0.0/0"
fn parse_network_address(text: &str) -> Result<IpAddr, ParseError> {
    let addr = text.split('/').next().unwrap_or(text);
    addr.parse::<IpAddr>()
        .map_err(|_| ParseError::InvalidAddress(text.to_string()))
}

/// Parse `iptables -L CHAIN -n -v -x`, skipping the two header lines
pub fn parse_counters(output: &str) -> Vec<CounterRecord> {
    output
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            !line.is_empty() && !line.starts_with("Chain ") && !line.starts_with("pkts ")
        })
        .filter_map(|line| match parse_counter_line(line) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("Skipping iptables counter line: {}", e);
                None
            }
        })
        .collect()
}

/// Polls the chain counters into the client registry
pub struct CounterMonitor;

impl CounterMonitor {
    pub fn new() -> Self {
        CounterMonitor
    }

    pub async fn start(
        &self,
        ctx: &ClientsModuleContext,
        shutdown_notify: std::sync::Arc<tokio::sync::Notify>,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(ctx.options.iptables_read_delay());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = shutdown_notify.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll(ctx).await {
                        log::error!("Failed to read iptables counters: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    log::info!("Counter monitoring module received shutdown signal, stopping...");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn poll(&self, ctx: &ClientsModuleContext) -> Result<()> {
        let chain = ctx.iptables.clone();
        let records = tokio::task::spawn_blocking(move || chain.stats()).await??;
        let created_at = Instant::now();

        ctx.registry.ingest_counters(&records, created_at)?;
        log::trace!(
            "Ingested {} counter records, {} in total",
            records.len(),
            format_bytes(records.iter().map(|r| r.bytes).sum())
        );
        Ok(())
    }
}

fn log_summary(ctx: &ClientsModuleContext) {
    let stats = ctx.registry.snapshot();
    let in_rate: f64 = stats.iter().map(|s| s.in_rate).sum();
    let out_rate: f64 = stats.iter().map(|s| s.out_rate).sum();
    log::debug!(
        "{} clients, in {} out {}",
        stats.len(),
        format_rate(in_rate),
        format_rate(out_rate)
    );
}

/// Adds rules for clients that appeared in the ARP table since the last run
pub struct RulesMonitor;

impl RulesMonitor {
    pub fn new() -> Self {
        RulesMonitor
    }

    pub async fn start(
        &self,
        ctx: &ClientsModuleContext,
        shutdown_notify: std::sync::Arc<tokio::sync::Notify>,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(ctx.options.iptables_rules_delay());
        // Rules were installed at startup
        interval.tick().await;
        let shutdown = shutdown_notify.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let chain = ctx.iptables.clone();
                    match tokio::task::spawn_blocking(move || chain.update()).await {
                        Ok(Ok(_)) => log_summary(ctx),
                        Ok(Err(e)) => log::error!("Failed to update iptables rules: {}", e),
                        Err(e) => log::error!("iptables update task failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    log::info!("Rules monitoring module received shutdown signal, stopping...");
                    break;
                }
            }
        }

        Ok(())
    }
}
