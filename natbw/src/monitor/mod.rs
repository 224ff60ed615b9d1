pub mod arp;
pub mod conntrack;
pub mod dns;
pub mod iptables;

use crate::api::ApiRouter;
use crate::command::Options;
use crate::flow::FlowClassifier;
use crate::monitor::iptables::IptablesChain;
use crate::storage::clients::ClientRegistry;
use crate::storage::oui::VendorDb;
use std::sync::Arc;

/// Clients module context: the registry and the feeds that keep it current
#[derive(Clone)]
pub struct ClientsModuleContext {
    pub options: Options,
    pub registry: Arc<ClientRegistry>,
    pub iptables: IptablesChain,
    pub vendor_db: Option<Arc<VendorDb>>,
}

impl ClientsModuleContext {
    pub fn new(
        options: Options,
        registry: Arc<ClientRegistry>,
        iptables: IptablesChain,
        vendor_db: Option<Arc<VendorDb>>,
    ) -> Self {
        Self {
            options,
            registry,
            iptables,
            vendor_db,
        }
    }
}

/// Conntrack module context
#[derive(Clone)]
pub struct ConntrackModuleContext {
    pub classifier: Arc<FlowClassifier>,
    pub conntrack_path: String,
}

impl ConntrackModuleContext {
    pub fn new(classifier: Arc<FlowClassifier>) -> Self {
        Self {
            classifier,
            conntrack_path: conntrack::CONNTRACK_PATH.to_string(),
        }
    }
}

/// Generic module context (for module manager)
#[derive(Clone)]
pub enum ModuleContext {
    Clients(ClientsModuleContext),
    Conntrack(ConntrackModuleContext),
    Nmap,
}

impl ModuleContext {
    fn module_type(&self) -> ModuleType {
        match self {
            ModuleContext::Clients(_) => ModuleType::Clients,
            ModuleContext::Conntrack(_) => ModuleType::Conntrack,
            ModuleContext::Nmap => ModuleType::Nmap,
        }
    }
}

/// Module type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    Clients,
    Conntrack,
    Nmap,
}

impl ModuleType {
    fn mount_apis(&self, ctx: &ModuleContext, api_router: &mut ApiRouter) -> anyhow::Result<()> {
        use crate::api::ApiHandler;

        match (self, ctx) {
            (ModuleType::Clients, ModuleContext::Clients(clients_ctx)) => {
                use crate::api::stats::StatsApiHandler;

                api_router.register_handler(ApiHandler::Stats(StatsApiHandler::new(
                    Arc::clone(&clients_ctx.registry),
                    clients_ctx.vendor_db.clone(),
                )));
                Ok(())
            }
            (ModuleType::Conntrack, ModuleContext::Conntrack(conntrack_ctx)) => {
                use crate::api::conntrack::ConntrackApiHandler;

                api_router.register_handler(ApiHandler::Conntrack(ConntrackApiHandler::new(
                    Arc::clone(&conntrack_ctx.classifier),
                    &conntrack_ctx.conntrack_path,
                )));
                Ok(())
            }
            (ModuleType::Nmap, ModuleContext::Nmap) => {
                use crate::api::nmap::NmapApiHandler;

                api_router.register_handler(ApiHandler::Nmap(NmapApiHandler::new()));
                Ok(())
            }
            _ => Err(anyhow::anyhow!("Module context type mismatch")),
        }
    }

    async fn start_monitoring(
        &self,
        ctx: ModuleContext,
        shutdown_notify: Arc<tokio::sync::Notify>,
    ) -> anyhow::Result<()> {
        match (self, ctx) {
            (ModuleType::Clients, ModuleContext::Clients(clients_ctx)) => {
                let counter_monitor = iptables::CounterMonitor::new();
                let rules_monitor = iptables::RulesMonitor::new();
                let arp_monitor = arp::ArpMonitor::new();
                let dns_monitor = dns::DnsMonitor::new();

                let (counters, rules, arp, dns) = tokio::join!(
                    counter_monitor.start(&clients_ctx, shutdown_notify.clone()),
                    rules_monitor.start(&clients_ctx, shutdown_notify.clone()),
                    arp_monitor.start(&clients_ctx, shutdown_notify.clone()),
                    dns_monitor.start(&clients_ctx, shutdown_notify),
                );
                for (name, result) in [
                    ("Counter", counters),
                    ("Rules", rules),
                    ("ARP", arp),
                    ("DNS", dns),
                ] {
                    if let Err(e) = result {
                        log::error!("{} monitoring module error: {}", name, e);
                    }
                }
                Ok(())
            }
            // Conntrack and nmap work on demand only
            (ModuleType::Conntrack, ModuleContext::Conntrack(_)) => Ok(()),
            (ModuleType::Nmap, ModuleContext::Nmap) => Ok(()),
            _ => Err(anyhow::anyhow!("Module context type mismatch")),
        }
    }
}

/// Monitor manager
pub struct MonitorManager {
    modules: Vec<ModuleType>,
    api_router: ApiRouter,
}

impl MonitorManager {
    /// One module per context, in the same order
    pub fn from_contexts(contexts: &[ModuleContext]) -> Self {
        MonitorManager {
            modules: contexts.iter().map(ModuleContext::module_type).collect(),
            api_router: ApiRouter::new(),
        }
    }

    #[cfg(test)]
    pub fn modules(&self) -> &[ModuleType] {
        &self.modules
    }

    /// Mount the API of every module
    pub fn init_modules(&mut self, contexts: &[ModuleContext]) -> anyhow::Result<()> {
        for (module, ctx) in self.modules.iter().zip(contexts.iter()) {
            module.mount_apis(ctx, &mut self.api_router)?;
        }
        log::info!("Mounted API routes: {}", self.api_router.routes().join(", "));
        Ok(())
    }

    /// Get the API router
    pub fn get_api_router(&self) -> &ApiRouter {
        &self.api_router
    }

    /// Start all modules
    pub fn start_modules(
        &self,
        contexts: Vec<ModuleContext>,
        shutdown_notify: Arc<tokio::sync::Notify>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        for (module, ctx) in self.modules.iter().copied().zip(contexts.into_iter()) {
            let shutdown_notify = shutdown_notify.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = module.start_monitoring(ctx, shutdown_notify).await {
                    log::error!("Module start error: {}", e);
                }
            });
            tasks.push(task);
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::LocalAddrs;

    #[test]
    fn test_mount_conntrack_and_nmap() {
        let contexts = vec![
            ModuleContext::Conntrack(ConntrackModuleContext::new(Arc::new(FlowClassifier::new(
                LocalAddrs::default(),
            )))),
            ModuleContext::Nmap,
        ];
        let mut manager = MonitorManager::from_contexts(&contexts);
        assert_eq!(manager.modules(), [ModuleType::Conntrack, ModuleType::Nmap]);

        manager.init_modules(&contexts).unwrap();
        assert_eq!(manager.get_api_router().routes(), ["/v0/nmap/", "/v1/conntrack"]);
    }

    #[test]
    fn test_context_mismatch() {
        let mut router = ApiRouter::new();
        assert!(ModuleType::Clients
            .mount_apis(&ModuleContext::Nmap, &mut router)
            .is_err());
    }
}
