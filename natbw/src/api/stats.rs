use crate::api::{HttpRequest, HttpResponse};
use crate::storage::clients::ClientRegistry;
use crate::storage::oui::{manufacturer_fallback, VendorDb};
use crate::utils::network_utils::compare_ip_str;
use anyhow::Result;
use natbw_common::ClientStat;
use std::cmp::Ordering;
use std::sync::Arc;

// Empty strings sort after every non-empty one
fn cmp_empty_last(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => a.cmp(b),
    }
}

pub fn order_by_ip(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| compare_ip_str(&a.ip, &b.ip));
}

pub fn order_by_in_rate(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| b.in_rate.total_cmp(&a.in_rate));
}

pub fn order_by_out_rate(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| b.out_rate.total_cmp(&a.out_rate));
}

pub fn order_by_hwaddr(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| a.hwaddr.cmp(&b.hwaddr));
}

pub fn order_by_name(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| cmp_empty_last(&a.name, &b.name));
}

pub fn order_by_manufacturer(stats: &mut [ClientStat]) {
    stats.sort_by(|a, b| cmp_empty_last(&a.manufacturer, &b.manufacturer));
}

/// IP order first, then the `order_by` key when it is known
pub fn apply_order(stats: &mut [ClientStat], order_by: Option<&str>) {
    order_by_ip(stats);
    match order_by {
        Some("rate_in") => order_by_in_rate(stats),
        Some("rate_out") => order_by_out_rate(stats),
        Some("hwaddr") => order_by_hwaddr(stats),
        Some("name") => order_by_name(stats),
        Some("manufacturer") => {
            order_by_hwaddr(stats);
            order_by_manufacturer(stats);
        }
        Some(other) => log::debug!("Ignoring unknown stats order '{}'", other),
        None => {}
    }
}

/// Keep rows whose ip, hwaddr or name equals any given value.
/// Without any filter value every row is kept.
pub fn filter_stats(
    stats: Vec<ClientStat>,
    ips: &[String],
    hwaddrs: &[String],
    names: &[String],
) -> Vec<ClientStat> {
    if ips.is_empty() && hwaddrs.is_empty() && names.is_empty() {
        return stats;
    }
    stats
        .into_iter()
        .filter(|s| ips.contains(&s.ip) || names.contains(&s.name) || hwaddrs.contains(&s.hwaddr))
        .collect()
}

/// Client bandwidth statistics API handler
#[derive(Clone)]
pub struct StatsApiHandler {
    registry: Arc<ClientRegistry>,
    vendor_db: Option<Arc<VendorDb>>,
}

impl StatsApiHandler {
    pub fn new(registry: Arc<ClientRegistry>, vendor_db: Option<Arc<VendorDb>>) -> Self {
        Self {
            registry,
            vendor_db,
        }
    }

    fn manufacturer(&self, hw_address: &str) -> String {
        if hw_address.is_empty() {
            return String::new();
        }
        match &self.vendor_db {
            Some(db) => match db.manufacturer(hw_address) {
                Ok(manufacturer) => manufacturer,
                Err(e) => {
                    log::warn!("Vendor lookup error: {}", e);
                    String::new()
                }
            },
            None => manufacturer_fallback(hw_address),
        }
    }

    /// Filtered and ordered snapshot with manufacturers filled in
    pub fn stats(&self, request: &HttpRequest) -> Vec<ClientStat> {
        let snapshot = self.registry.snapshot();
        let mut stats: Vec<ClientStat> = filter_stats(
            snapshot,
            request.query_all("ip"),
            request.query_all("hwaddr"),
            request.query_all("name"),
        )
        .into_iter()
        .map(|mut stat| {
            stat.manufacturer = self.manufacturer(&stat.hwaddr);
            stat
        })
        .collect();

        apply_order(&mut stats, request.query("order_by"));
        stats
    }

    pub async fn handle_request(&self, request: &HttpRequest) -> Result<HttpResponse> {
        if request.method != "GET" {
            return Ok(HttpResponse::error(405, "Method Not Allowed".to_string()));
        }

        let stats = self.stats(request);
        match serde_json::to_string(&stats) {
            Ok(body) => Ok(HttpResponse::ok(body)),
            Err(e) => {
                log::error!("Failed to serialize client stats: {}", e);
                Ok(HttpResponse::error(500, e.to_string()))
            }
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec!["/v1/stats"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::parse_http_request;
    use crate::storage::clients::CounterRecord;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn stat(ip: &str, name: &str, hwaddr: &str, in_rate: f64, manufacturer: &str) -> ClientStat {
        ClientStat {
            ip: ip.to_string(),
            name: name.to_string(),
            hwaddr: hwaddr.to_string(),
            in_rate,
            out_rate: 0.0,
            manufacturer: manufacturer.to_string(),
        }
    }

    fn ips(stats: &[ClientStat]) -> Vec<&str> {
        stats.iter().map(|s| s.ip.as_str()).collect()
    }

    fn sample() -> Vec<ClientStat> {
        vec![
            stat("192.168.1.10", "", "00:00:00:00:00:03", 10.0, "Acme"),
            stat("192.168.1.9", "nas", "00:00:00:00:00:01", 30.0, ""),
            stat("192.168.1.100", "apple", "00:00:00:00:00:02", 30.0, "Acme"),
            stat("192.168.1.2", "tv", "00:00:00:00:00:04", 5.0, "Beta"),
        ]
    }

    #[test]
    fn test_order_by_ip_is_numeric() {
        let mut stats = sample();
        apply_order(&mut stats, None);
        assert_eq!(
            ips(&stats),
            ["192.168.1.2", "192.168.1.9", "192.168.1.10", "192.168.1.100"]
        );
    }

    #[test]
    fn test_order_by_rate_keeps_ip_order_for_ties() {
        let mut stats = sample();
        apply_order(&mut stats, Some("rate_in"));
        assert_eq!(
            ips(&stats),
            ["192.168.1.9", "192.168.1.100", "192.168.1.10", "192.168.1.2"]
        );
    }

    #[test]
    fn test_order_by_name_empty_last() {
        let mut stats = sample();
        apply_order(&mut stats, Some("name"));
        assert_eq!(
            ips(&stats),
            ["192.168.1.100", "192.168.1.9", "192.168.1.2", "192.168.1.10"]
        );
    }

    #[test]
    fn test_order_by_manufacturer() {
        let mut stats = sample();
        apply_order(&mut stats, Some("manufacturer"));
        // Ties broken by hardware address
        assert_eq!(
            ips(&stats),
            ["192.168.1.100", "192.168.1.10", "192.168.1.2", "192.168.1.9"]
        );
    }

    #[test]
    fn test_unknown_order_is_ip_order() {
        let mut stats = sample();
        apply_order(&mut stats, Some("bogus"));
        assert_eq!(stats[0].ip, "192.168.1.2");
    }

    #[test]
    fn test_filter_stats() {
        let all = filter_stats(sample(), &[], &[], &[]);
        assert_eq!(all.len(), 4);

        let filtered = filter_stats(
            sample(),
            &["192.168.1.2".to_string()],
            &["00:00:00:00:00:01".to_string()],
            &["apple".to_string(), "nobody".to_string()],
        );
        assert_eq!(
            ips(&filtered),
            ["192.168.1.9", "192.168.1.100", "192.168.1.2"]
        );
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let registry = Arc::new(ClientRegistry::new(
            8,
            HashMap::from([("02:00:00:00:00:01".to_string(), "laptop".to_string())]),
        ));
        let t0 = Instant::now();
        let record = |ip: &str, bytes| CounterRecord {
            source: "0.0.0.0".parse().unwrap(),
            destination: ip.parse().unwrap(),
            bytes,
        };
        registry
            .ingest_counters(&[record("192.168.1.20", 0), record("192.168.1.30", 0)], t0)
            .unwrap();
        registry
            .ingest_counters(
                &[record("192.168.1.20", 1000), record("192.168.1.30", 3000)],
                t0 + Duration::from_secs(1),
            )
            .unwrap();
        registry.ingest_identity("192.168.1.20", "02:00:00:00:00:01");
        registry.ingest_identity("192.168.1.30", "01:00:5e:00:00:01");

        let db = VendorDb::load("AC:DE:48\tAcme Inc\n").unwrap();
        let handler = StatsApiHandler::new(registry, Some(Arc::new(db)));

        let request =
            parse_http_request(b"GET /v1/stats/?order_by=rate_in HTTP/1.1\r\n\r\n").unwrap();
        let response = handler.handle_request(&request).await.unwrap();
        assert_eq!(response.status, 200);

        let stats: Vec<ClientStat> = serde_json::from_str(&response.body).unwrap();
        assert_eq!(ips(&stats), ["192.168.1.30", "192.168.1.20"]);
        assert_eq!(stats[0].manufacturer, "{multicast}");
        assert_eq!(stats[1].manufacturer, "{local/random}");
        assert_eq!(stats[1].name, "laptop");
        assert!((stats[0].in_rate - 3000.0).abs() < 1e-9);

        let request = parse_http_request(b"GET /v1/stats/?name=laptop HTTP/1.1\r\n\r\n").unwrap();
        let stats: Vec<ClientStat> =
            serde_json::from_str(&handler.handle_request(&request).await.unwrap().body).unwrap();
        assert_eq!(ips(&stats), ["192.168.1.20"]);
    }
}
