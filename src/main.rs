use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use zonecert::{
    config::Settings, telemetry, CertificateService, DynDnsService, RenewalController,
};

#[derive(Parser)]
#[command(name = "zonecert", version, about = "Certificates for managed DNS zones")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the renewal controller (and dynamic DNS when enabled) until Ctrl-C
    Serve,
    /// Run one admin command and print its output
    Exec {
        /// Command name; `help` lists them
        name: String,
        /// Command arguments
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // 1. Load configuration
    let settings = Settings::load()?;
    settings.validate()?;

    // 2. Initialize telemetry
    telemetry::init_logging(&settings)?;

    let settings = Arc::new(settings);
    let service = Arc::new(CertificateService::from_settings(settings.clone())?);

    match cli.command {
        Command::Exec { name, args } => {
            let output = service.execute_command(&name, &args).await?;
            println!("{}", output);
        }
        Command::Serve => serve(settings, service).await?,
    }

    Ok(())
}

async fn serve(settings: Arc<Settings>, service: Arc<CertificateService>) -> Result<()> {
    info!(app = %settings.general.app_name, "Starting zonecert");
    let cancel = CancellationToken::new();

    let controller = Arc::new(RenewalController::new(service.clone()));
    let renewal_task = controller.start(
        Duration::from_secs(settings.certificate.check_interval_secs),
        cancel.clone(),
    );

    let dyndns_task = if settings.dns.dyndns.enabled {
        let dyndns = Arc::new(DynDnsService::new(
            service.repository().clone(),
            service.providers().clone(),
            service.whois().clone(),
        ));
        Some(dyndns.start(
            Duration::from_secs(settings.dns.dyndns.interval_secs),
            settings.dns.dyndns.sub_domains.clone(),
            cancel.clone(),
        ))
    } else {
        None
    };

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping zonecert...");

    // In-flight renewals observe the token and still clean up their challenge records.
    cancel.cancel();
    for task in renewal_task.into_iter().chain(dyndns_task) {
        task.await?;
    }
    info!("zonecert stopped");
    Ok(())
}
