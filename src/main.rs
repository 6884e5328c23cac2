use clap::Parser;
use ferry_loader::adapters::spade::HttpDealDispatcher;
use ferry_loader::config::cli::ManifestReader;
use ferry_loader::core::retry::RetryPolicy;
use ferry_loader::core::runtime::LoadSummary;
use ferry_loader::domain::ports::DealDispatcher;
use ferry_loader::utils::error::ErrorSeverity;
use ferry_loader::utils::monitor::RunMonitor;
use ferry_loader::utils::{logger, validation::Validate};
use ferry_loader::{CliConfig, LocalRuntime, OutputFormat, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let config = CliConfig::parse();

    // 初始化日誌
    logger::init_cli_logger(config.verbose);

    tracing::info!("Starting ferry-loader CLI");
    if config.verbose {
        tracing::debug!("CLI config: {:?}", config);
    }

    // 驗證參數
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    match run(&config).await {
        Ok(summary) => {
            print_summary(&summary, config.output);
            if !summary.dead_letters.is_empty() {
                tracing::warn!(
                    "⚠️ {} records were dead-lettered",
                    summary.dead_letters.len()
                );
                std::process::exit(2);
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Load failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };

            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}

async fn run(config: &CliConfig) -> Result<LoadSummary> {
    let file = config.load_file()?;
    if let Some(file) = &file {
        file.validate()?;
    }
    let settings = config.resolve(file.as_ref())?;
    settings.validate()?;
    if let Some(name) = file.as_ref().and_then(|f| f.service_name()) {
        tracing::info!("📋 Service: {}", name);
    }
    tracing::info!(
        "🚢 Ferries hold {}..={} bytes, {:?} selection",
        settings.ferry.min_cargo_size,
        settings.ferry.max_cargo_size,
        settings.ferry.selection_policy
    );

    let cars = ManifestReader::new(&config.manifest).read()?;

    let monitor = RunMonitor::new(config.monitor_enabled(file.as_ref()));
    if monitor.is_enabled() {
        tracing::info!("🔍 System monitoring enabled");
    }

    let runtime = LocalRuntime::start(&settings);
    for (index, chunk) in cars.chunks(config.insert_chunk).enumerate() {
        runtime.put_cars(chunk).await?;
        monitor.record_cars(chunk.len());
        if index % 100 == 99 {
            monitor.log_stats("inserting");
        }
    }
    tracing::info!("📥 Inserted {} cars, waiting for consumers", cars.len());

    let drained = runtime
        .wait_until_idle(Duration::from_secs(config.wait_secs))
        .await;
    monitor.log_final_stats();
    let summary = runtime.summary();
    runtime.shutdown().await;
    drained?;
    let summary = summary?;

    if let Some(endpoint) = config.dispatcher_endpoint(file.as_ref()) {
        let retry = config.dispatcher_retry(file.as_ref(), &settings);
        let dispatcher = HttpDealDispatcher::new(endpoint, RetryPolicy::from(&retry))?;
        for ferry_id in &summary.ready_signals {
            dispatcher.ferry_ready(ferry_id).await?;
        }
    }

    tracing::info!(
        "✅ {} cars in {} ferries, {} ready",
        summary.cargo_count,
        summary.ferries.len(),
        summary.ready_count()
    );
    Ok(summary)
}

fn print_summary(summary: &LoadSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("❌ Cannot render summary: {}", e),
        },
        OutputFormat::Table => {
            println!("{:<32} {:<16} {:>16} {:>8}", "FERRY", "STATE", "SIZE", "CARS");
            for ferry in &summary.ferries {
                println!(
                    "{:<32} {:<16} {:>16} {:>8}",
                    ferry.id.as_str(),
                    ferry.state.as_str(),
                    ferry.size,
                    ferry.cargo_count
                );
            }
            println!(
                "{} cars, {} bytes in {} ferries ({} ready)",
                summary.cargo_count,
                summary.total_size,
                summary.ferries.len(),
                summary.ready_count()
            );
            for link in &summary.dead_letters {
                println!("dead letter: {}", link);
            }
        }
    }
}
