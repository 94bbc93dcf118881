mod cli;
mod config;
mod wiring;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::LedgerConfig;
use ledger_core::Currency;
use ledger_heal::DriftHealer;
use ledger_heal::HealOutcome;
use tracing::info;
use tracing::warn;
use wiring::Backend;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let config = LedgerConfig::from_env();
    let backend = Backend::build(&config);

    if cli::run_harness(&cli, &config, &backend).await? {
        return Ok(());
    }

    if !cli.wants_serve() {
        return Ok(());
    }

    spawn_heal_loop(backend.healer.clone(), &config);

    let router = ledger_api::router(backend.api_state());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "ledger-server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Runs the configured tenant's drift sweep on a fixed cadence, comparing
/// the reserve account across the two configured regions. A stale or
/// absent watermark is the expected steady state between reconciliation
/// feeds, so it's logged at debug rather than treated as a failure.
fn spawn_heal_loop(healer: Arc<DriftHealer>, config: &LedgerConfig) {
    let tenant_id = config.heal_tenant_id.clone();
    let account_id = config.heal_reserve_account.clone();
    let suspense_account = config.heal_suspense_account.clone();
    let region_a = config.heal_region_a.clone();
    let region_b = config.heal_region_b.clone();
    let currency = Currency::new(
        config.supported_currencies.first().cloned().unwrap_or_else(|| "NGN".to_string()),
        2,
    )
    .expect("configured supported currency is well-formed");
    let rate_seconds = config.heal_rate_seconds;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(rate_seconds.max(1)));
        loop {
            interval.tick().await;
            match healer
                .heal(&tenant_id, &account_id, &currency, &region_a, &region_b, &suspense_account)
                .await
            {
                Ok(HealOutcome::NothingToHeal) => {}
                Ok(HealOutcome::Compensated { entry_id, amount_minor }) => {
                    info!(tenant_id = %tenant_id, account_id = %account_id, entry_id, amount_minor, "drift heal sweep compensated");
                }
                Ok(HealOutcome::ExceedsCap { diff_minor }) => {
                    warn!(tenant_id = %tenant_id, account_id = %account_id, diff_minor, "drift heal sweep exceeded cap, alerting");
                }
                Err(err) => {
                    tracing::debug!(tenant_id = %tenant_id, error = %err, "drift heal sweep skipped");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!(error = %err, "failed to install shutdown signal handler"),
    }
}
