use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use logloader::db::{self, reports, repositories};
use logloader::ingest::ingest_files;
use logloader::tail::{follow, FollowEvent, TailCursor};
use logloader::{BatchLoader, Config, LineParser};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "logloader")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Load web server access logs into SQLite and report on them")]
struct Cli {
    /// TOML configuration file, defaults apply when it does not exist
    #[arg(short, long, global = true, env = "LOGLOADER_CONFIG", default_value = "logloader.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse log files and load them, several files are loaded in parallel
    ProcessLogs {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Follow a log file and load lines as they are appended
    TailLogs {
        file: PathBuf,
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
    },
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },
    /// Delete entries older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: u32,
    },
}

#[derive(Subcommand)]
enum ReportKind {
    TopIps {
        #[arg(default_value = "10")]
        n: u32,
    },
    StatusCodes,
    HourlyTraffic,
    TopPages {
        #[arg(default_value = "10")]
        n: u32,
    },
    TrafficByOs,
    ErrorsByDate {
        /// YYYY-MM-DD
        date: String,
    },
    Stats,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let parser = LineParser::with_patterns(&config.parser.patterns)
        .context("compiling log patterns")?;
    let pool = db::init(&config.database)
        .with_context(|| format!("opening database {}", config.database.path))?;

    match cli.command {
        Commands::ProcessLogs { files, batch_size } => {
            let batch_size = batch_size.unwrap_or(config.ingest.batch_size);
            if batch_size == 0 {
                bail!("--batch-size must be at least 1");
            }
            let mut failed_files = 0;
            for (path, result) in ingest_files(&pool, &files, &parser, batch_size) {
                match result {
                    Ok(summary) => println!(
                        "{}: {} lines, {} parsed, {} malformed, {} new entries, {} failed batches",
                        path.display(),
                        summary.lines,
                        summary.parsed,
                        summary.errors,
                        summary.inserted,
                        summary.failed_batches
                    ),
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "could not process log file");
                        failed_files += 1;
                    }
                }
            }
            if failed_files > 0 {
                bail!("{} of {} files could not be processed", failed_files, files.len());
            }
        }
        Commands::TailLogs { file, interval } => {
            let interval = match interval {
                Some(0) => bail!("--interval must be at least 1"),
                Some(secs) => Duration::from_secs(secs),
                None => config.follow_interval(),
            };
            let mut cursor = TailCursor::at_end(&file)
                .with_context(|| format!("opening {}", file.display()))?;
            let mut conn = pool.get().context("getting a database connection")?;
            let mut loader = BatchLoader::new(&mut conn);
            let mut parser = parser;

            let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
            ctrlc::set_handler(move || {
                let _ = cancel_tx.try_send(());
            })
            .context("installing the Ctrl-C handler")?;

            let (events_tx, events_rx) = crossbeam_channel::unbounded();
            let printer = std::thread::spawn(move || {
                for event in events_rx {
                    match event {
                        FollowEvent::Processed(report) if report.inserted > 0 => {
                            println!("{} new entries processed", report.inserted)
                        }
                        FollowEvent::Processed(_) => {}
                        FollowEvent::Failed(err) => eprintln!("batch failed: {}", err),
                    }
                }
            });

            println!("Monitoring {} (Ctrl-C to stop)", file.display());
            follow(
                &mut cursor,
                &mut parser,
                &mut loader,
                interval,
                &cancel_rx,
                &events_tx,
            );
            drop(events_tx);
            let _ = printer.join();

            let stats = parser.stats();
            info!(
                parsed = stats.parsed,
                errors = stats.errors,
                "monitoring stopped"
            );
        }
        Commands::Report { kind } => {
            let conn = pool.get().context("getting a database connection")?;
            print_report(&conn, kind)?;
        }
        Commands::Cleanup { days } => {
            let mut conn = pool.get().context("getting a database connection")?;
            let summary = repositories::cleanup_old_entries(&mut conn, days)?;
            println!(
                "Deleted {} log entries and {} unused user agents older than {} days",
                summary.deleted_entries, summary.deleted_user_agents, days
            );
        }
    }
    Ok(())
}

fn print_report(conn: &rusqlite::Connection, kind: ReportKind) -> Result<()> {
    match kind {
        ReportKind::TopIps { n } => {
            println!("Top {} requesting IP addresses:", n);
            print_counts(&reports::top_ips(conn, n)?, "IP Address");
        }
        ReportKind::StatusCodes => {
            println!("HTTP status code distribution:");
            println!("{:<12} {:>10} {:>10}", "Status Code", "Count", "Percent");
            for share in reports::status_code_distribution(conn)? {
                println!(
                    "{:<12} {:>10} {:>9.2}%",
                    share.status_code, share.count, share.percentage
                );
            }
        }
        ReportKind::HourlyTraffic => {
            println!("Hourly traffic:");
            print_counts(&reports::hourly_traffic(conn)?, "Hour");
        }
        ReportKind::TopPages { n } => {
            println!("Top {} requested paths:", n);
            print_counts(&reports::top_pages(conn, n)?, "Path");
        }
        ReportKind::TrafficByOs => {
            println!("Traffic by operating system:");
            print_counts(&reports::traffic_by_os(conn)?, "Operating System");
        }
        ReportKind::ErrorsByDate { date } => {
            chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .with_context(|| format!("'{}' is not a YYYY-MM-DD date", date))?;
            println!("Error logs for {}:", date);
            for row in reports::error_logs_by_date(conn, &date)? {
                println!(
                    "{}  {:<15} {} {}  {}",
                    row.timestamp, row.ip_address, row.status_code, row.path, row.user_agent
                );
            }
        }
        ReportKind::Stats => {
            let stats = reports::database_stats(conn)?;
            println!("Log entries:  {}", stats.total_log_entries);
            println!("User agents:  {}", stats.total_user_agents);
            println!("Unique IPs:   {}", stats.unique_ips);
            println!(
                "Date range:   {} .. {}",
                stats.earliest.as_deref().unwrap_or("-"),
                stats.latest.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn print_counts(rows: &[(String, i64)], label: &str) {
    let width = rows
        .iter()
        .map(|(key, _)| key.len())
        .chain(std::iter::once(label.len()))
        .max()
        .unwrap_or(0);
    println!("{:<width$} {:>10}", label, "Requests", width = width);
    for (key, count) in rows {
        println!("{:<width$} {:>10}", key, count, width = width);
    }
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
