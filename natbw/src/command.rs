use crate::flow::{FlowClassifier, LocalAddrs};
use crate::monitor::iptables::IptablesChain;
use crate::monitor::{ClientsModuleContext, ConntrackModuleContext, ModuleContext, MonitorManager};
use crate::storage::clients::ClientRegistry;
use crate::storage::hostname::{load_aliases, parse_aliases};
use crate::storage::oui::VendorDb;
use crate::system::log_startup_info;
use crate::utils::network_utils::get_local_addresses;
use crate::web;
use clap::{Args, Parser};
use log::info;
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// Common arguments
#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    #[clap(long, env = "NATBWMON_LAN_IF", default_value = "br0", help = "LAN interface the clients are on")]
    pub lan_if: String,

    #[clap(
        long,
        env = "NATBWMON_LISTEN",
        default_value = "0.0.0.0:8833",
        help = "Web server listening address"
    )]
    pub listen: String,

    #[clap(
        long,
        env = "NATBWMON_WEB_LOG",
        default_value = "false",
        help = "Enable web request logging (per-HTTP-request line)"
    )]
    pub web_log: bool,

    #[clap(
        long,
        env = "NATBWMON_LOG_LEVEL",
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    pub log_level: String,
}

/// iptables accounting arguments
#[derive(Debug, Args, Clone)]
pub struct IptablesArgs {
    #[clap(long, env = "NATBWMON_CHAIN", default_value = "NATBW", help = "Name of the accounting chain")]
    pub chain: String,

    #[clap(
        long,
        env = "NATBWMON_CLEAR",
        default_value = "false",
        help = "Remove the accounting chain and exit"
    )]
    pub clear: bool,

    #[clap(
        long,
        env = "NATBWMON_IPTABLES_READ_DELAY_MS",
        default_value = "400",
        help = "Counter read interval (milliseconds)"
    )]
    pub iptables_read_delay_ms: u64,

    #[clap(
        long,
        env = "NATBWMON_IPTABLES_RULES_DELAY_SECS",
        default_value = "10",
        help = "Interval between rule refreshes for new clients (seconds)"
    )]
    pub iptables_rules_delay_secs: u64,
}

/// Client tracking arguments
#[derive(Debug, Args, Clone)]
pub struct ClientArgs {
    #[clap(
        long,
        env = "NATBWMON_AVG_SAMPLES",
        default_value = "8",
        help = "Number of rate samples in the moving average"
    )]
    pub avg_samples: usize,

    #[clap(
        long,
        env = "NATBWMON_ARP_DELAY_SECS",
        default_value = "5",
        help = "ARP table refresh interval (seconds)"
    )]
    pub arp_delay_secs: u64,

    #[clap(
        long,
        env = "NATBWMON_DNS_DELAY_SECS",
        default_value = "60",
        help = "Reverse DNS refresh interval (seconds)"
    )]
    pub dns_delay_secs: u64,

    #[clap(
        long,
        env = "NATBWMON_ALIASES",
        default_value = "",
        help = "Client names by hardware address: mac=name,mac=name"
    )]
    pub aliases: String,

    #[clap(long, env = "NATBWMON_ALIASES_FILE", help = "File with 'mac name' alias lines")]
    pub aliases_file: Option<String>,

    #[clap(
        long,
        env = "NATBWMON_OUI_DB",
        default_value = "/usr/share/wireshark/manuf",
        help = "Vendor database (Wireshark manuf format)"
    )]
    pub oui_db: String,
}

/// Optional features
#[derive(Debug, Args, Clone)]
pub struct FeatureArgs {
    #[clap(
        long,
        env = "NATBWMON_NMAP",
        default_value = "false",
        help = "Enable the nmap port scan endpoint"
    )]
    pub nmap: bool,
}

#[derive(Debug, Parser, Clone)]
#[clap(name = "natbw")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Per-client bandwidth and NAT flow monitor for Linux routers")]
pub struct Options {
    #[clap(flatten)]
    pub common: CommonArgs,

    #[clap(flatten)]
    pub iptables: IptablesArgs,

    #[clap(flatten)]
    pub client: ClientArgs,

    #[clap(flatten)]
    pub feature: FeatureArgs,
}

impl Options {
    pub fn lan_if(&self) -> &str {
        &self.common.lan_if
    }

    pub fn listen(&self) -> &str {
        &self.common.listen
    }

    pub fn web_log(&self) -> bool {
        self.common.web_log
    }

    pub fn log_level(&self) -> &str {
        &self.common.log_level
    }

    pub fn chain(&self) -> &str {
        &self.iptables.chain
    }

    pub fn clear(&self) -> bool {
        self.iptables.clear
    }

    pub fn iptables_read_delay(&self) -> Duration {
        Duration::from_millis(self.iptables.iptables_read_delay_ms)
    }

    pub fn iptables_rules_delay(&self) -> Duration {
        Duration::from_secs(self.iptables.iptables_rules_delay_secs)
    }

    pub fn avg_samples(&self) -> usize {
        self.client.avg_samples
    }

    pub fn arp_delay(&self) -> Duration {
        Duration::from_secs(self.client.arp_delay_secs)
    }

    pub fn dns_delay(&self) -> Duration {
        Duration::from_secs(self.client.dns_delay_secs)
    }

    pub fn aliases(&self) -> &str {
        &self.client.aliases
    }

    pub fn aliases_file(&self) -> Option<&Path> {
        self.client.aliases_file.as_deref().map(Path::new)
    }

    pub fn oui_db(&self) -> &str {
        &self.client.oui_db
    }

    pub fn nmap(&self) -> bool {
        self.feature.nmap
    }
}

// Validate arguments
fn validate_arguments(opt: &Options) -> Result<(), anyhow::Error> {
    if opt.lan_if().is_empty() {
        return Err(anyhow::anyhow!("LAN interface cannot be empty"));
    }

    let listen = SocketAddr::from_str(opt.listen())
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", opt.listen(), e))?;
    if listen.port() == 0 {
        return Err(anyhow::anyhow!("Port number cannot be 0"));
    }

    if LevelFilter::from_str(opt.log_level()).is_err() {
        return Err(anyhow::anyhow!("Invalid log level '{}'", opt.log_level()));
    }

    if opt.chain().is_empty() {
        return Err(anyhow::anyhow!("Chain name cannot be empty"));
    }

    if opt.avg_samples() == 0 {
        return Err(anyhow::anyhow!("avg_samples must be greater than 0"));
    }

    for (name, interval) in [
        ("iptables_read_delay_ms", opt.iptables_read_delay()),
        ("iptables_rules_delay_secs", opt.iptables_rules_delay()),
        ("arp_delay_secs", opt.arp_delay()),
        ("dns_delay_secs", opt.dns_delay()),
    ] {
        if interval.is_zero() {
            return Err(anyhow::anyhow!("{} must be greater than 0", name));
        }
    }

    parse_aliases(opt.aliases()).map_err(|e| anyhow::anyhow!("Invalid aliases: {:#}", e))?;

    Ok(())
}

fn load_vendor_db(path: &str) -> Option<Arc<VendorDb>> {
    match VendorDb::from_file(path) {
        Ok(db) => {
            info!(
                "Loaded vendor database {} ({} + {} address blocks)",
                path,
                db.len24(),
                db.len48()
            );
            Some(Arc::new(db))
        }
        Err(e) => {
            log::warn!("Vendor lookup disabled, failed to load {}: {}", path, e);
            None
        }
    }
}

// Create module contexts: registry, classifier and the optional nmap endpoint
fn create_module_contexts(
    options: &Options,
    iptables: IptablesChain,
) -> Result<Vec<ModuleContext>, anyhow::Error> {
    let mut module_contexts = Vec::new();

    let aliases = load_aliases(options.aliases(), options.aliases_file())?;
    info!("Loaded {} client aliases", aliases.len());

    let registry = Arc::new(ClientRegistry::new(options.avg_samples(), aliases));
    let vendor_db = load_vendor_db(options.oui_db());
    module_contexts.push(ModuleContext::Clients(ClientsModuleContext::new(
        options.clone(),
        registry,
        iptables,
        vendor_db,
    )));

    let local_addrs = LocalAddrs::new(get_local_addresses()?);
    info!("Found {} local addresses", local_addrs.len());
    let classifier = Arc::new(FlowClassifier::new(local_addrs));
    module_contexts.push(ModuleContext::Conntrack(ConntrackModuleContext::new(classifier)));

    if options.nmap() {
        module_contexts.push(ModuleContext::Nmap);
    }

    Ok(module_contexts)
}

// Install the accounting chain, returns it for the feed loops
fn install_chain(options: &Options) -> Result<IptablesChain, anyhow::Error> {
    let iptables = IptablesChain::new(options.chain(), options.lan_if());
    iptables.delete()?;
    iptables.clear_chain()?;
    let rules = iptables.update()?;
    info!("Installed chain {} with {} client rules", iptables.name(), rules);
    Ok(iptables)
}

// Run service: install rules, start the feeds and the web server
async fn run_service(options: &Options) -> Result<(), anyhow::Error> {
    if options.clear() {
        let iptables = IptablesChain::new(options.chain(), options.lan_if());
        iptables.delete()?;
        info!("Removed chain {}", iptables.name());
        return Ok(());
    }

    let iptables = install_chain(options)?;

    let module_contexts = match create_module_contexts(options, iptables.clone()) {
        Ok(contexts) => contexts,
        Err(e) => {
            if let Err(cleanup) = iptables.delete() {
                log::error!("Failed to remove chain {}: {}", iptables.name(), cleanup);
            }
            return Err(e);
        }
    };

    // Use Notify for graceful shutdown
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let shutdown = shutdown_notify.notified();
    tokio::pin!(shutdown);

    let shutdown_notify_clone = shutdown_notify.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, gracefully shutting down...");
            shutdown_notify_clone.notify_waiters();
        }
    });

    // Create monitor manager (modules are inferred from contexts)
    let mut monitor_manager = MonitorManager::from_contexts(&module_contexts);
    monitor_manager.init_modules(&module_contexts)?;

    // Start web server with API router
    let api_router = monitor_manager.get_api_router().clone();
    let options_for_web = options.clone();
    let shutdown_notify_for_web = shutdown_notify.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) =
            web::start_server(options_for_web, api_router, shutdown_notify_for_web).await
        {
            log::error!("Web server error: {}", e);
        }
    });

    let mut tasks = monitor_manager.start_modules(module_contexts, shutdown_notify.clone());
    tasks.push(web_task);

    // Wait for shutdown signal
    shutdown.await;
    info!("Stopping all modules...");

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Module task error: {}", e);
        }
    }

    iptables.delete()?;
    info!("Removed chain {}, program exiting", iptables.name());

    Ok(())
}

pub async fn run(options: Options) -> Result<(), anyhow::Error> {
    // Validate arguments
    validate_arguments(&options)?;

    // Set up logging
    let level = LevelFilter::from_str(options.log_level()).unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter(None, level)
        .target(env_logger::Target::Stdout)
        .init();

    // Startup diagnostics
    log_startup_info(&options);

    run_service(&options).await?;

    Ok(())
}
