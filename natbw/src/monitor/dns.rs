use crate::monitor::arp::read_arp_table;
use crate::monitor::ClientsModuleContext;
use crate::storage::clients::ClientRegistry;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Source of reverse DNS names
pub trait Resolver: Send + Sync {
    /// `Ok(None)` when the address has no name
    fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// The system resolver (`getnameinfo`)
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn reverse_lookup(&self, ip: IpAddr) -> Result<Option<String>> {
        let name = dns_lookup::lookup_addr(&ip)
            .with_context(|| format!("Reverse lookup of {} failed", ip))?;
        Ok(host_name(&name))
    }
}

// The resolver answers with the numeric address when there is no PTR record
fn host_name(name: &str) -> Option<String> {
    let name = name.trim_end_matches('.');
    let numeric = name
        .split('%')
        .next()
        .map_or(false, |addr| addr.parse::<IpAddr>().is_ok());
    if name.is_empty() || numeric {
        None
    } else {
        Some(name.to_string())
    }
}

/// Resolve every address, addresses without a name map to an empty string.
/// Failed lookups are logged and left out so the previous name is kept.
pub fn resolve_names<R: Resolver + ?Sized>(
    ips: &[String],
    resolver: &R,
) -> HashMap<String, String> {
    let mut names = HashMap::with_capacity(ips.len());
    for ip_str in ips {
        let ip = match ip_str.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                log::debug!("Not resolving invalid address '{}'", ip_str);
                continue;
            }
        };
        match resolver.reverse_lookup(ip) {
            Ok(name) => {
                names.insert(ip_str.clone(), name.unwrap_or_default());
            }
            Err(e) => log::warn!("{:#}", e),
        }
    }
    names
}

/// Periodically re-resolves the names of the LAN clients
pub struct DnsMonitor {
    resolver: Arc<dyn Resolver>,
}

impl DnsMonitor {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        DnsMonitor { resolver }
    }

    pub async fn start(
        &self,
        ctx: &ClientsModuleContext,
        shutdown_notify: Arc<tokio::sync::Notify>,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(ctx.options.dns_delay());
        let shutdown = shutdown_notify.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh(ctx).await {
                        log::error!("Failed to refresh host names: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    log::info!("DNS monitoring module received shutdown signal, stopping...");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn refresh(&self, ctx: &ClientsModuleContext) -> Result<()> {
        let ips: Vec<String> = read_arp_table(ctx.options.lan_if())?
            .into_iter()
            .map(|e| e.ip_address)
            .collect();

        let updated = self.update_names(&ctx.registry, ips).await?;
        log::debug!("Host name refresh updated {} clients", updated);
        Ok(())
    }

    /// Resolve `ips` on the blocking pool and feed the results to the registry
    pub async fn update_names(
        &self,
        registry: &ClientRegistry,
        ips: Vec<String>,
    ) -> Result<usize> {
        let resolver = Arc::clone(&self.resolver);
        let names =
            tokio::task::spawn_blocking(move || resolve_names(&ips, resolver.as_ref())).await?;
        Ok(registry.ingest_names(&names))
    }
}
