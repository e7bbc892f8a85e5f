use clap::Parser;
use portal_bridge::transaction::batch::{self, Job};
use portal_bridge::{
    Config, EokaProvider, Outcome, PageProvider, Params, TransactionController,
    TransactionRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "portal-bridge")]
#[command(about = "Headless data entry for AJAX/XML grid portals")]
#[command(version)]
struct Cli {
    /// Job file to run
    job: PathBuf,

    /// Run in headless mode (overrides job)
    #[arg(long)]
    headless: bool,

    /// Write fields and report the form without saving
    #[arg(long)]
    dry_run: bool,

    /// Run each record as its own transaction on its own page
    #[arg(long)]
    per_record: bool,

    /// Transactions running at once with --per-record
    #[arg(long, default_value_t = 2)]
    parallel: usize,

    /// Set a parameter (can be used multiple times)
    #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate job without running
    #[arg(long)]
    check: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> portal_bridge::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    // logs go to stderr; stdout carries the JSON result
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let params = Params::from_args(&cli.params)?;
    let mut config = Config::load_with_params(&cli.job, &params)?;
    let screen = Arc::new(config.screen()?.clone());

    if cli.check {
        println!("Job valid: {}", config.name);
        println!("  Target: {}", config.target.url);
        println!(
            "  Screen: {} ({})",
            screen.name,
            screen.version.as_deref().unwrap_or("unversioned")
        );
        println!(
            "  Fields: {} (stride {})",
            screen.fields.len(),
            screen.record_stride
        );
        println!("  Records: {}", config.records.len());
        if !config.params.is_empty() {
            println!("  Parameters: {}", config.params.len());
            for (name, def) in &config.params {
                let req = if def.required { " (required)" } else { "" };
                let desc = def.description.as_deref().unwrap_or("");
                println!("    - {}{}: {}", name, req, desc);
            }
        }
        return Ok(());
    }

    if cli.headless {
        config.browser.headless = true;
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    let controller = Arc::new(TransactionController::from_config(&config)?);
    let provider = Arc::new(EokaProvider::launch(&config.browser, &config.target.url).await?);

    let success = if cli.per_record {
        let jobs = config
            .records
            .iter()
            .map(|record| {
                let request = TransactionRequest::new(vec![record.clone()])
                    .search(config.search.clone().or_else(|| Some(record.name.clone())))
                    .dry_run(config.dry_run);
                Job::new(record.name.clone(), Arc::clone(&screen), request)
            })
            .collect();
        let results = batch::run_all(
            Arc::clone(&controller),
            Arc::clone(&provider) as Arc<dyn PageProvider>,
            jobs,
            cli.parallel,
        )
        .await;

        let mut report = serde_json::Map::new();
        let mut all_ok = true;
        for job in results {
            let value = match job.result {
                Ok(result) => {
                    all_ok &= result.outcome == Outcome::Success;
                    serde_json::to_value(&result)?
                }
                Err(e) => {
                    all_ok = false;
                    serde_json::json!({ "error": e.to_string() })
                }
            };
            report.insert(job.label, value);
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        all_ok
    } else {
        let page = provider.open_page().await?;
        let result = controller.run(page, screen, config.request()).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        result.is_success()
    };

    if let Ok(provider) = Arc::try_unwrap(provider) {
        provider.close().await?;
    }

    if !success {
        std::process::exit(1);
    }

    Ok(())
}
