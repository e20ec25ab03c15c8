mod cli;

use anyhow::{Result, bail};
use catalog_host::catalog::{
    Catalog, CatalogInstalled, CatalogLocal, CatalogRegistry, DirectoryCatalogLoader,
    DirectoryPackageManager, InstallEventBridge, InstallStep, Installer, RemoteCatalogCache,
    Source, find_installable, find_updates,
};
use catalog_host::config::Config;
use catalog_host::storage::CatalogDatabase;
use catalog_host::utils::paths::{get_crash_log_path, get_database_path, get_logs_dir};
use chrono::Local;
use clap::Parser;
use cli::{Cli, Commands};
use futures_util::StreamExt;
use std::fs;
use std::io::Write;
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Install a panic hook that writes crash information to a log file
fn install_crash_handler() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        if let Ok(crash_log_path) = get_crash_log_path() {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let mut crash_report = format!("=== CRASH at {} ===\n", timestamp);

            if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
                crash_report.push_str(&format!("Message: {}\n", message));
            } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
                crash_report.push_str(&format!("Message: {}\n", message));
            }

            if let Some(location) = panic_info.location() {
                crash_report.push_str(&format!(
                    "Location: {}:{}:{}\n",
                    location.file(),
                    location.line(),
                    location.column()
                ));
            }

            crash_report.push_str(&format!(
                "\nBacktrace:\n{}\n\n",
                std::backtrace::Backtrace::force_capture()
            ));

            if let Some(parent) = crash_log_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Ok(mut file) = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&crash_log_path)
            {
                let _ = file.write_all(crash_report.as_bytes());
                eprintln!("\nCrash logged to: {}", crash_log_path.display());
            }
        }

        default_hook(panic_info);
    }));
}

/// Initialize file-based logging.
///
/// Logs are written to ~/.cathost/logs/cathost.log, rolling daily.
/// Log level can be controlled with RUST_LOG env var (default: info).
fn init_file_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = get_logs_dir().ok()?;

    if let Err(e) = fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Could not create logs directory: {}", e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "cathost.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Some(guard)
}

/// Collaborators wired from the configuration.
struct Host {
    client: reqwest::Client,
    repository_url: String,
    system_dir: PathBuf,
    local_dir: PathBuf,
    download_dir: PathBuf,
    loader: Arc<DirectoryCatalogLoader>,
}

impl Host {
    fn new(config: &Config) -> Result<Self> {
        let system_dir = config.packages.system_dir()?;
        let local_dir = config.packages.local_dir()?;
        let download_dir = config.packages.download_dir()?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("cathost/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;

        let loader = Arc::new(DirectoryCatalogLoader::new(
            config.bundled_catalogs(),
            system_dir.clone(),
            local_dir.clone(),
        ));

        Ok(Self {
            client,
            repository_url: config.repository.url.clone(),
            system_dir,
            local_dir,
            download_dir,
            loader,
        })
    }

    fn remote_cache(&self) -> Result<RemoteCatalogCache> {
        let store = Arc::new(CatalogDatabase::open(&get_database_path()?)?);
        Ok(RemoteCatalogCache::new(
            self.client.clone(),
            self.repository_url.clone(),
            store,
        ))
    }

    fn installer(&self) -> Installer {
        let packages = Arc::new(DirectoryPackageManager::new(self.system_dir.clone()));
        Installer::new(self.client.clone(), packages, self.download_dir.clone())
    }

    fn bridge(&self) -> InstallEventBridge {
        InstallEventBridge::new(vec![self.system_dir.clone(), self.local_dir.clone()])
    }
}

fn kind_label(catalog: &CatalogLocal) -> &'static str {
    match catalog {
        CatalogLocal::Bundled(_) => "bundled",
        CatalogLocal::Installed(CatalogInstalled::SystemWide(_)) => "system",
        CatalogLocal::Installed(CatalogInstalled::Locally { .. }) => "local",
    }
}

fn print_local(catalogs: &[CatalogLocal]) {
    println!("{:<20} {:<24} {:<6} {:<10} KIND", "SOURCE ID", "NAME", "LANG", "VERSION");
    println!("{}", "-".repeat(72));
    for catalog in catalogs {
        let version = catalog
            .as_installed()
            .map(|i| i.version_name().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<24} {:<6} {:<10} {}",
            catalog.source_id(),
            catalog.name(),
            catalog.source().lang(),
            version,
            kind_label(catalog)
        );
    }
}

async fn handle_list(host: &Host) -> Result<()> {
    let registry = CatalogRegistry::load(host.loader.clone()).await?;
    print_local(&registry.catalogs());
    Ok(())
}

async fn handle_remote(host: &Host, refresh: bool) -> Result<()> {
    let cache = host.remote_cache()?;
    cache.load_persisted().await?;
    if refresh {
        cache.refresh(true).await?;
    }

    let catalogs = cache.catalogs();
    if catalogs.is_empty() {
        println!("No remote catalogs cached.");
        println!("\nFetch the repository index with: cathost remote --refresh");
        return Ok(());
    }

    let registry = CatalogRegistry::load(host.loader.clone()).await?;
    let installable: Vec<i64> = find_installable(&registry.catalogs(), &catalogs)
        .iter()
        .map(|c| c.source_id)
        .collect();

    println!("{:<28} {:<24} {:<6} {:<10} STATUS", "PACKAGE", "NAME", "LANG", "VERSION");
    println!("{}", "-".repeat(80));
    for catalog in catalogs.iter() {
        let status = if installable.contains(&catalog.source_id) {
            "available"
        } else {
            "installed"
        };
        let name = if catalog.nsfw {
            format!("{} (18+)", catalog.name)
        } else {
            catalog.name.clone()
        };
        println!(
            "{:<28} {:<24} {:<6} {:<10} {}",
            catalog.pkg_name, name, catalog.lang, catalog.version_name, status
        );
    }
    Ok(())
}

async fn handle_install(host: &Host, pkg_name: &str) -> Result<()> {
    let cache = host.remote_cache()?;
    let mut catalogs = cache.load_persisted().await?;
    if !catalogs.iter().any(|c| c.pkg_name == pkg_name) {
        cache.refresh(false).await?;
        catalogs = cache.catalogs();
    }

    let Some(catalog) = catalogs.iter().find(|c| c.pkg_name == pkg_name).cloned() else {
        bail!("Package '{}' is not available from {}", pkg_name, host.repository_url);
    };

    println!("Installing {} v{}...", catalog.name, catalog.version_name);
    let mut steps = host.installer().download_and_install(catalog);
    while let Some(step) = steps.next().await {
        match step {
            InstallStep::Installed => {
                println!("\x1b[32m[OK]\x1b[0m Installed {}", pkg_name);
            }
            InstallStep::Error(message) => {
                bail!("Install of {} failed: {}", pkg_name, message);
            }
            step => println!("  {}", step),
        }
    }
    Ok(())
}

async fn handle_uninstall(host: &Host, pkg_name: &str) -> Result<()> {
    if host.installer().uninstall_apk(pkg_name).await {
        println!("\x1b[32m[OK]\x1b[0m Uninstalled {}", pkg_name);
        Ok(())
    } else {
        bail!("Package '{}' was not uninstalled", pkg_name)
    }
}

async fn handle_updates(host: &Host) -> Result<()> {
    let registry = CatalogRegistry::load(host.loader.clone()).await?;
    let cache = host.remote_cache()?;
    cache.load_persisted().await?;
    if let Err(e) = cache.refresh(false).await {
        eprintln!("Warning: could not update catalog list: {:#}", e);
    }

    let updates = find_updates(&registry.catalogs(), &cache.catalogs());
    if updates.is_empty() {
        println!("All catalogs are up to date.");
        return Ok(());
    }

    for update in updates {
        println!(
            "{:<28} {} -> {}",
            update.installed.pkg_name(),
            update.installed.version_name(),
            update.available.version_name
        );
    }
    Ok(())
}

async fn handle_watch(host: &Host) -> Result<()> {
    let bridge = host.bridge();
    let registry = CatalogRegistry::initialize(host.loader.clone(), &bridge).await?;
    let mut snapshots = registry.observe();

    print_local(&snapshots.borrow_and_update());
    println!("\nWatching for package changes (Ctrl+C to stop)");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("\n[{}]", Local::now().format("%H:%M:%S"));
                print_local(&snapshot);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    bridge.unregister();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_crash_handler();

    let cli = Cli::parse();

    // Guard must be kept alive for the duration of the process
    let _log_guard = init_file_logging();
    tracing::info!(command = ?cli.command, "cathost starting");

    let config = Config::load()?;
    let host = Host::new(&config)?;

    match cli.command {
        Commands::List => handle_list(&host).await,
        Commands::Remote { refresh } => handle_remote(&host, refresh).await,
        Commands::Install { pkg_name } => handle_install(&host, &pkg_name).await,
        Commands::Uninstall { pkg_name } => handle_uninstall(&host, &pkg_name).await,
        Commands::Updates => handle_updates(&host).await,
        Commands::Watch => handle_watch(&host).await,
    }
}
