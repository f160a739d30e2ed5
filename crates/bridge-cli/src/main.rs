use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;

use bridge_sync::{maybe_build_scheduler, BridgePipeline, DateRange, RunSummary, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Commerce order bridge command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull orders for a date window into the relational store
    SyncOrders {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Upstream timestamp the window applies to
        #[arg(long, default_value = "global_purchase_time")]
        date_type: String,
    },
    /// Refresh the store roster
    SyncStores,
    /// Refresh the warehouse list
    SyncWarehouses,
    /// Pull inventory details for all known warehouses
    SyncInventory,
    /// Pull per-SKU sales statistics for a date window (90 days max)
    SyncSales {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Optional comma-separated store id filter
        #[arg(long)]
        sids: Option<String>,
    },
    /// Re-pull everything updated yesterday (orders, then stores)
    DailyRefresh,
    /// Export new order lines to the downstream table
    ExportOrders,
    /// Replace the downstream warehouse table
    ExportWarehouses,
    /// Export new inventory rows to the downstream table
    ExportInventory,
    /// Export newly cancelled orders to the downstream table
    ExportCancelOrders {
        /// Only orders cancelled after this timestamp (e.g. "2026-08-01 00:00:00")
        #[arg(long)]
        cancelled_after: Option<String>,
    },
    /// Replace the downstream sales summary table
    ExportSalesSummary,
    /// Run the cron scheduler in the foreground
    Schedule,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} expected={} processed={} skipped={} aborted={}",
        summary.job,
        summary.run_id,
        summary.expected_total,
        summary.processed,
        summary.skipped_records,
        summary.aborted
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    let pipeline = BridgePipeline::connect(config).await?;

    match cli.command {
        Commands::SyncOrders {
            start,
            end,
            date_type,
        } => {
            let range = DateRange::new(start, end)?;
            print_summary(&pipeline.sync_orders(&range, &date_type).await?);
        }
        Commands::SyncStores => print_summary(&pipeline.sync_stores().await?),
        Commands::SyncWarehouses => print_summary(&pipeline.sync_warehouses().await?),
        Commands::SyncInventory => print_summary(&pipeline.sync_inventory().await?),
        Commands::SyncSales { start, end, sids } => {
            let range = DateRange::new(start, end)?;
            print_summary(&pipeline.sync_sales(&range, sids.as_deref()).await?);
        }
        Commands::DailyRefresh => print_summary(&pipeline.daily_order_refresh().await?),
        Commands::ExportOrders => {
            let created = pipeline.export_orders().await?;
            println!("order export complete: created={created}");
        }
        Commands::ExportWarehouses => {
            let created = pipeline.export_warehouses().await?;
            println!("warehouse export complete: created={created}");
        }
        Commands::ExportInventory => {
            let created = pipeline.export_inventory().await?;
            println!("inventory export complete: created={created}");
        }
        Commands::ExportCancelOrders { cancelled_after } => {
            let created = pipeline
                .export_cancel_orders(cancelled_after.as_deref())
                .await?;
            println!("cancelled order export complete: created={created}");
        }
        Commands::ExportSalesSummary => {
            let created = pipeline.export_sales_summary().await?;
            println!("sales summary export complete: created={created}");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let scheduler = maybe_build_scheduler(pipeline)
                .await?
                .context("scheduler is disabled, set BRIDGE_SCHEDULER_ENABLED=1")?;
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
