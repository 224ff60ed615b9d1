use crate::command::Options;
use crate::monitor::conntrack::CONNTRACK_PATH;
use log::{info, warn};
use std::fs;
use std::path::Path;

fn first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|l| !l.is_empty())
}

fn kernel_release() -> String {
    let ostype = first_line("/proc/sys/kernel/ostype");
    let release = first_line("/proc/sys/kernel/osrelease");
    match (ostype, release) {
        (Some(ostype), Some(release)) => format!("{} {}", ostype, release),
        _ => first_line("/proc/version").unwrap_or_else(|| "unknown".to_string()),
    }
}

fn hostname() -> String {
    first_line("/proc/sys/kernel/hostname")
        .or_else(|| first_line("/etc/hostname"))
        .unwrap_or_else(|| "unknown".to_string())
}

// Effective user id, iptables changes need root
fn effective_uid() -> u32 {
    unsafe { libc::geteuid() as u32 }
}

// net.netfilter.nf_conntrack_acct, absent on kernels without conntrack
fn conntrack_accounting() -> Option<bool> {
    first_line("/proc/sys/net/netfilter/nf_conntrack_acct").map(|v| v == "1")
}

pub fn log_startup_info(options: &Options) {
    let uid = effective_uid();

    info!("natbw v{} started", env!("CARGO_PKG_VERSION"));
    info!("Host: {} (euid={})", hostname(), uid);
    info!("Kernel: {}", kernel_release());
    info!(
        "Platform: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if uid != 0 {
        warn!("Not running as root, iptables rule maintenance will fail");
    }

    info!("Listening on: {}", options.listen());
    info!("Log level: {}", options.log_level());
    info!("LAN interface: {}", options.lan_if());
    info!("iptables chain: {}", options.chain());
    info!(
        "Intervals: counters {:?}, rules {:?}, ARP {:?}, DNS {:?}",
        options.iptables_read_delay(),
        options.iptables_rules_delay(),
        options.arp_delay(),
        options.dns_delay()
    );
    info!("Rate window: {} samples", options.avg_samples());
    if options.nmap() {
        info!("nmap endpoint enabled");
    }

    if !Path::new("/sys/class/net").join(options.lan_if()).exists() {
        warn!("LAN interface {} was not found", options.lan_if());
    }
    if !Path::new(CONNTRACK_PATH).exists() {
        warn!("{} is missing, the conntrack endpoint will fail", CONNTRACK_PATH);
    } else if conntrack_accounting() == Some(false) {
        warn!("nf_conntrack_acct is off, flow byte counts will be zero");
    }
    if !Path::new(options.oui_db()).exists() {
        warn!("Vendor database {} does not exist", options.oui_db());
    }
}
