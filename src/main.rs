use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use country_metrics::config::Settings;
use country_metrics::logging;
use country_metrics::pipeline::collector::{create_collector, Collector, COUNTRY_COLLECTOR};
use country_metrics::pipeline::run::{self, LoadRunReport, NormalizeReport};
use country_metrics::pipeline::sources::SourceManifest;
use country_metrics::storage::{MetricsStore, SqliteStore};

#[derive(Parser)]
#[command(name = "country_metrics")]
#[command(about = "Normalize socio-economic country datasets and upsert them into a store")]
#[command(version = "0.1.0")]
struct Cli {
    /// Source manifest (TOML); the bundled reference manifest when omitted
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Directory holding one raw file per source
    #[arg(long, global = true)]
    raw_dir: Option<PathBuf>,

    /// Processed dataset path
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Collector used to read raw sources (country, city)
    #[arg(long, global = true, default_value = COUNTRY_COLLECTOR)]
    collector: String,

    /// Print run reports as JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read raw sources and write the processed dataset
    Normalize,
    /// Upsert the processed dataset into the store at DATABASE_URL
    Load,
    /// Normalize then load; load is skipped if normalize fails
    Run,
    /// Print the header and first rows of every manifest source
    Inspect {
        #[arg(long, default_value_t = 5)]
        rows: usize,
    },
}

fn print_normalize(report: &NormalizeReport) {
    println!("\n📊 Normalize results (run {}):", report.run_id);
    for source in &report.sources {
        println!(
            "   {:<32} {:>7} observations → {:>5} annual values",
            source.metric, source.observations, source.annual_values
        );
    }
    println!("   Rows written: {}", report.rows_written);
    println!("   Dropped (no metrics): {}", report.exclusions.dropped_empty_rows);
    println!("   Excluded (validation): {}", report.exclusions.excluded_rows);
    println!("   Unparseable cells read as absent: {}", report.unparseable_cells());
    println!("   Output file: {}", report.output_path.display());
    println!("   Fingerprint: {}", report.fingerprint);

    if !report.exclusions.is_clean() {
        println!("\n⚠️  Sample of excluded rows:");
        for rejection in &report.exclusions.sample {
            println!(
                "   - ({}, {}): {}",
                rejection.entity_code,
                rejection.year,
                rejection.violations.join("; ")
            );
        }
    }
}

fn print_load(report: &LoadRunReport) {
    let load = &report.load;
    println!("\n💾 Load results (run {}):", report.run_id);
    println!("   Rows in dataset: {}", load.rows_in_dataset);
    println!("   Rows written: {}", load.rows_written);
    println!("   Batches committed: {}", load.batches_committed);
    println!("   Post-load check: {}", if load.verified { "passed" } else { "FAILED" });
    if !load.failed_batches.is_empty() {
        println!("\n⚠️  Failed batches:");
        for failure in &load.failed_batches {
            match (&failure.entity_code, failure.year) {
                (Some(code), Some(year)) => {
                    println!("   - batch {} at ({}, {}): {}", failure.batch_index, code, year, failure.message)
                }
                _ => println!("   - batch {}: {}", failure.batch_index, failure.message),
            }
        }
    }
}

fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn MetricsStore>> {
    let store = SqliteStore::open(settings.database_url()?, settings.busy_timeout)?;
    Ok(Arc::new(store))
}

fn inspect(manifest: &SourceManifest, collector: &dyn Collector, rows: usize) {
    for source in &manifest.sources {
        println!("\n🔎 {} ({})", source.id, source.file);
        match collector.collect(source) {
            Ok(table) => {
                println!("   Columns ({}): {}", table.columns().len(), table.columns().join(", "));
                println!("   Rows: {}", table.len());
                for cells in table.rows().take(rows) {
                    let rendered: Vec<String> = cells.iter().map(|c| c.render()).collect();
                    println!("   | {}", rendered.join(" | "));
                }
            }
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Could not read source");
                println!("   ❌ {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Some(path) = cli.manifest {
        settings.manifest_path = Some(path);
    }
    if let Some(dir) = cli.raw_dir {
        settings.raw_dir = dir;
    }
    if let Some(output) = cli.output {
        settings.output_path = output;
    }
    let manifest = settings.load_manifest()?;
    let collector = create_collector(&cli.collector, &settings)?;

    match cli.command {
        Commands::Normalize => {
            eprintln!("🔄 Running normalize...");
            let report = run::normalize(&settings, &manifest, collector.as_ref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_normalize(&report);
            }
        }
        Commands::Load => {
            eprintln!("📥 Running load...");
            let store = open_store(&settings)?;
            let report = run::load(&settings, store).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_load(&report);
            }
        }
        Commands::Run => {
            eprintln!("🚀 Running full pipeline (normalize + load)...");
            let store = open_store(&settings)?;
            match run::run_all(&settings, &manifest, collector.as_ref(), store).await {
                Ok(report) if cli.json => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Ok(report) => {
                    print_normalize(&report.normalize);
                    print_load(&report.load);
                    info!("Full pipeline completed");
                    println!("\n✅ Full pipeline completed");
                }
                Err(failure) => {
                    error!(stage = %failure.stage, error = %failure.error, "Pipeline failed");
                    println!("❌ Pipeline failed during {}: {}", failure.stage, failure.error);
                    return Err(failure.into());
                }
            }
        }
        Commands::Inspect { rows } => {
            inspect(&manifest, collector.as_ref(), rows);
        }
    }
    Ok(())
}
