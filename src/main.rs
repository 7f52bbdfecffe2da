use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairdesk::alert_notifier::AlertNotifier;
use pairdesk::config::get_smtp_config_from_env;
use pairdesk::pairtrade::{CycleReport, PairTradeConfig, PairTradeEngine};
use pairdesk::status::StatusReporter;
use std::env;
use std::io::Write;
use std::str::FromStr;
use tokio::time::{sleep, Duration};

fn init_logging() {
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    let offset = FixedOffset::east_opt(offset_seconds)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();
}

async fn publish(
    engine: &PairTradeEngine,
    report: &CycleReport,
    notifier: &AlertNotifier,
    status: Option<&StatusReporter>,
) {
    if let Some(reporter) = status {
        if let Err(err) = reporter.write_snapshot(&engine.snapshot()) {
            log::warn!(
                "[STATUS] failed to write status {}: {:?}",
                reporter.path().display(),
                err
            );
        }
    }
    if report.alerts.is_empty() {
        return;
    }
    let notifier = notifier.clone();
    let alerts = report.alerts.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || notifier.notify(&alerts)).await {
        log::warn!("[ALERT] notifier task failed: {:?}", err);
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let git_hash = option_env!("PAIRDESK_GIT_HASH").unwrap_or("unknown");
    log::info!("pairdesk git: {}", git_hash);

    let cfg = PairTradeConfig::from_env_or_yaml()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:#}", e)))?;
    log::info!(
        "[CONFIG] pairs={} entry_z={} exit_z={} leg_allocation={} unit_decimals={} interval={}s",
        cfg.universe.len(),
        cfg.entry_z,
        cfg.exit_z,
        cfg.leg_allocation,
        cfg.unit_decimals,
        cfg.interval_secs
    );

    let smtp = get_smtp_config_from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let notifier = AlertNotifier::new(smtp.as_ref(), "pairdesk")
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{:#}", e)))?;
    if notifier.email_enabled() {
        log::info!("[CONFIG] email alerts enabled");
    }
    let status = cfg.status_file.as_ref().map(StatusReporter::new);
    let interval = Duration::from_secs(cfg.interval_secs.max(1));

    let mut engine = PairTradeEngine::new(cfg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)))?;

    if let Some(replay) = engine.replay() {
        log::info!(
            "[BACKTEST] Running in backtest mode from {:?} ({} steps).",
            replay.current_date(),
            replay.remaining() + 1
        );
        loop {
            match engine.run_cycle().await {
                Ok(report) => publish(&engine, &report, &notifier, status.as_ref()).await,
                Err(e) => log::warn!("[BACKTEST] {:?}: {}", replay.current_date(), e),
            }
            if !replay.tick() {
                log::info!("[BACKTEST] End of data file reached. Backtest finished.");
                break;
            }
        }
        let ledger = engine.ledger();
        log::info!(
            "[BACKTEST] capital={} completed_trades={} active_hedges={}",
            ledger.capital(),
            ledger.completed_trades(),
            ledger.active_hedges()
        );
        return Ok(());
    }

    log::info!("[LIVE] Running in live mode.");
    loop {
        match engine.run_cycle().await {
            Ok(report) => publish(&engine, &report, &notifier, status.as_ref()).await,
            Err(e) => log::warn!(
                "⏳ Market data feed down. Retrying in {} seconds... ({})",
                interval.as_secs(),
                e
            ),
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("[LIVE] shutdown requested");
                break;
            }
            _ = sleep(interval) => {}
        }
    }
    Ok(())
}
