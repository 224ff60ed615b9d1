pub mod format_utils {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    // Convert bytes to human-readable format
    pub fn format_bytes(bytes: u64) -> String {
        let value = bytes as f64;
        if value >= GB {
            format!("{:.2} GB", value / GB)
        } else if value >= MB {
            format!("{:.2} MB", value / MB)
        } else if value >= KB {
            format!("{:.2} KB", value / KB)
        } else {
            format!("{} B", bytes)
        }
    }

    // Convert rate to human-readable format
    pub fn format_rate(bytes_per_sec: f64) -> String {
        if bytes_per_sec >= GB {
            format!("{:.2} GB/s", bytes_per_sec / GB)
        } else if bytes_per_sec >= MB {
            format!("{:.2} MB/s", bytes_per_sec / MB)
        } else if bytes_per_sec >= KB {
            format!("{:.2} KB/s", bytes_per_sec / KB)
        } else {
            format!("{:.0} B/s", bytes_per_sec)
        }
    }

    // Format MAC address
    pub fn format_mac(mac: &[u8; 6]) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }

}

pub mod network_utils {
    use anyhow::Context;
    use std::cmp::Ordering;
    use std::net::IpAddr;
    use std::process::Command;

    // Parse "aa:bb:cc:dd:ee:ff" or "aa-bb-cc-dd-ee-ff", separators may not be mixed
    pub fn parse_mac_address(mac_str: &str) -> Result<[u8; 6], anyhow::Error> {
        let mac_str = mac_str.trim();
        let separator = mac_str
            .chars()
            .find(|c| *c == ':' || *c == '-')
            .with_context(|| format!("Invalid MAC address format: '{}'", mac_str))?;

        let parts: Vec<&str> = mac_str.split(separator).collect();
        if parts.len() != 6 {
            return Err(anyhow::anyhow!("Invalid MAC address format: '{}'", mac_str));
        }

        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(anyhow::anyhow!("Invalid MAC segment '{}'", part));
            }
            mac[i] = u8::from_str_radix(part, 16)?;
        }

        Ok(mac)
    }

    pub fn is_multicast_mac(mac: &[u8; 6]) -> bool {
        mac[0] & 0x01 != 0
    }

    pub fn is_locally_administered(mac: &[u8; 6]) -> bool {
        mac[0] & 0x02 != 0
    }

    /// fe80::/10
    pub fn is_ipv6_link_local(ip: &std::net::Ipv6Addr) -> bool {
        (ip.segments()[0] & 0xffc0) == 0xfe80
    }

    /// Numeric address order, IPv4 before IPv6, unparseable strings last
    pub fn compare_ip_str(a: &str, b: &str) -> Ordering {
        match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        }
    }

    /// Every address configured on any interface of this host
    pub fn get_local_addresses() -> Result<Vec<IpAddr>, anyhow::Error> {
        let output = Command::new("ip")
            .args(["-o", "addr", "show"])
            .output()
            .context("Failed to run 'ip -o addr show'")?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "'ip -o addr show' failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(parse_ip_addr_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    // One line per address: "2: eth0    inet 192.168.1.1/24 brd ... scope global eth0"
    pub fn parse_ip_addr_output(output: &str) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        for line in output.lines() {
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                if token != "inet" && token != "inet6" {
                    continue;
                }
                let Some(cidr) = tokens.next() else { break };
                let addr = cidr.split('/').next().unwrap_or(cidr);
                match addr.parse::<IpAddr>() {
                    Ok(ip) => {
                        if !addrs.contains(&ip) {
                            addrs.push(ip);
                        }
                    }
                    Err(_) => log::debug!("Ignoring unparseable address '{}'", cidr),
                }
                break;
            }
        }
        addrs
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_mac_address() {
            assert_eq!(
                parse_mac_address("00:11:22:aa:BB:cc").unwrap(),
                [0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]
            );
            assert_eq!(
                parse_mac_address("00-11-22-33-44-55").unwrap(),
                [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]
            );
            assert!(parse_mac_address("00:11:22:33:44").is_err());
            assert!(parse_mac_address("00:11:22:33:44:55:66").is_err());
            assert!(parse_mac_address("00:11:22:33:44:zz").is_err());
            assert!(parse_mac_address("001:1:22:33:44:55").is_err());
            assert!(parse_mac_address("00:11-22:33:44:55").is_err());
            assert!(parse_mac_address("00-11-22-33-44:55").is_err());
            assert!(parse_mac_address("00:11:22:33:44:+5").is_err());
            assert!(parse_mac_address("001122334455").is_err());
            assert!(parse_mac_address("").is_err());
        }

        #[test]
        fn test_mac_flag_bits() {
            assert!(is_multicast_mac(&[0x01, 0x00, 0x5e, 0, 0, 1]));
            assert!(!is_multicast_mac(&[0x02, 0, 0, 0, 0, 1]));
            assert!(is_locally_administered(&[0x02, 0, 0, 0, 0, 1]));
            assert!(!is_locally_administered(&[0x00, 0x11, 0x22, 0, 0, 1]));
        }

        #[test]
        fn test_ipv6_link_local() {
            assert!(is_ipv6_link_local(&"fe80::1".parse().unwrap()));
            assert!(is_ipv6_link_local(&"febf::1".parse().unwrap()));
            assert!(!is_ipv6_link_local(&"fec0::1".parse().unwrap()));
            assert!(!is_ipv6_link_local(&"2001:db8::1".parse().unwrap()));
        }

        #[test]
        fn test_compare_ip_str() {
            assert_eq!(compare_ip_str("10.0.0.9", "10.0.0.10"), Ordering::Less);
            assert_eq!(compare_ip_str("10.0.0.10", "::1"), Ordering::Less);
            assert_eq!(compare_ip_str("garbage", "10.0.0.1"), Ordering::Greater);
        }

        #[test]
        fn test_parse_ip_addr_output() {
            let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
1: lo    inet6 ::1/128 scope host \\       valid_lft forever preferred_lft forever
2: br0    inet 192.168.1.1/24 brd 192.168.1.255 scope global br0\\       valid_lft forever preferred_lft forever
2: br0    inet6 fe80::1/64 scope link \\       valid_lft forever preferred_lft forever
3: wan    inet 203.0.113.7/24 scope global wan\\       valid_lft forever preferred_lft forever
3: wan    inet 203.0.113.7/24 scope global secondary wan
";
            let addrs = parse_ip_addr_output(output);
            let expected: Vec<IpAddr> = ["127.0.0.1", "::1", "192.168.1.1", "fe80::1", "203.0.113.7"]
                .iter()
                .map(|s| s.parse().unwrap())
                .collect();
            assert_eq!(addrs, expected);
        }
    }
}
