//! nwb-stream CLI - inspect NWB datasets through the cached remote reader.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nwb_stream::catalog::{Catalog, DandiCatalog};
use nwb_stream::container::{ArrayValues, NodeKind};
use nwb_stream::nwb::{IntervalTable, Substructure};
use nwb_stream::{Config, Result, Session};

/// Cached remote loader for NWB datasets on the DANDI Archive
#[derive(Parser)]
#[command(name = "nwb-stream", version, about, long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Disk cache directory
    #[arg(long, global = true, env = "NWB_STREAM_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Read everything from the source, bypassing the disk cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show strategy, metadata and which well-known parts are present
    #[command(alias = "i")]
    Info { locator: String },
    /// Show the hierarchy
    #[command(alias = "t")]
    Tree {
        locator: String,
        /// Maximum depth to descend
        #[arg(short, long)]
        depth: Option<usize>,
    },
    /// Spike counts per unit
    #[command(alias = "u")]
    Units { locator: String },
    /// Rows of an interval table
    Intervals {
        locator: String,
        /// Table name under intervals/
        #[arg(default_value = "trials")]
        name: String,
    },
    /// List the object URLs of a dandiset
    Assets {
        dandiset: String,
        /// Published version (default: draft)
        #[arg(long)]
        version: Option<String>,
        /// List reference descriptors instead of download URLs
        #[arg(long)]
        lindi: bool,
    },
    /// Open every asset of a dandiset in turn and summarize it
    Scan {
        dandiset: String,
        #[arg(long)]
        version: Option<String>,
        /// Stop after this many assets
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_dir(dir);
    }
    if cli.no_cache {
        config = config.without_cache();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Info { locator } => cmd_info(locator, &config),
        Commands::Tree { locator, depth } => cmd_tree(locator, *depth, &config),
        Commands::Units { locator } => cmd_units(locator, &config),
        Commands::Intervals { locator, name } => cmd_intervals(locator, name, &config),
        Commands::Assets {
            dandiset,
            version,
            lindi,
        } => cmd_assets(dandiset, version.as_deref(), *lindi, &config),
        Commands::Scan {
            dandiset,
            version,
            limit,
        } => cmd_scan(dandiset, version.as_deref(), *limit, &config),
    }
}

fn catalog(version: Option<&str>, config: &Config) -> Result<DandiCatalog> {
    let catalog = DandiCatalog::new(config)?;
    Ok(match version {
        Some(v) => catalog.with_version(v),
        None => catalog,
    })
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_info(locator: &str, config: &Config) -> Result<()> {
    let session = Session::open(locator, config)?;
    let nwb = session.nwb();
    let meta = nwb.metadata()?;

    println!("Locator:  {}", session.locator());
    println!("Strategy: {}", session.strategy());
    println!("Format:   {}", session.file().format_name());
    if let Some(v) = &meta.nwb_version {
        println!("NWB:      {v}");
    }
    if let Some(id) = &meta.identifier {
        println!("Identifier: {id}");
    }
    if let Some(desc) = &meta.session_description {
        println!("Session:  {desc}");
    }
    if let Some(start) = &meta.session_start_time {
        println!("Start:    {start}");
    }

    println!();
    for what in Substructure::WELL_KNOWN {
        let mark = if nwb.has(what)? { "yes" } else { "-" };
        println!("  {:<14} {mark}", what.to_string());
    }
    for name in nwb.interval_names()? {
        let what = Substructure::from_name(&name);
        if !Substructure::WELL_KNOWN.contains(&what) {
            println!("  {:<14} yes", format!("intervals/{name}"));
        }
    }
    Ok(())
}

fn cmd_tree(locator: &str, depth: Option<usize>, config: &Config) -> Result<()> {
    let session = Session::open(locator, config)?;
    let file = session.file();
    println!("/");
    file.walk("", depth, |node, level| {
        let indent = "  ".repeat(level);
        match node.kind() {
            NodeKind::Group => println!("{indent}{}/", node.name()),
            NodeKind::Array => {
                let info = node.array_info()?;
                let shape: Vec<String> = info.shape.iter().map(u64::to_string).collect();
                println!("{indent}{} {} [{}]", node.name(), info.dtype, shape.join(", "));
            }
        }
        Ok(())
    })
}

fn cmd_units(locator: &str, config: &Config) -> Result<()> {
    let session = Session::open(locator, config)?;
    let units = session.nwb().units()?;

    println!("{:>8} {:>10} {:>12} {:>12}", "unit", "spikes", "first", "last");
    for (id, spikes) in units.iter() {
        let first = spikes.first().map_or("-".to_string(), |t| format!("{t:.4}"));
        let last = spikes.last().map_or("-".to_string(), |t| format!("{t:.4}"));
        println!("{id:>8} {:>10} {first:>12} {last:>12}", spikes.len());
    }
    println!("{} units, {} spikes", units.len(), units.total_events());
    report_skipped(units.skipped_columns());
    Ok(())
}

fn cmd_intervals(locator: &str, name: &str, config: &Config) -> Result<()> {
    let session = Session::open(locator, config)?;
    let table = session.nwb().intervals(&Substructure::from_name(name))?;
    print_intervals(&table);
    report_skipped(table.skipped_columns());
    Ok(())
}

fn print_intervals(table: &IntervalTable) {
    let names: Vec<&str> = table.column_names().collect();
    print!("{:>6} {:>12} {:>12}", "id", "start", "stop");
    for name in &names {
        print!("  {name}");
    }
    println!();

    for (row, (&id, &(start, stop))) in table.ids().iter().zip(table.intervals()).enumerate() {
        print!("{id:>6} {start:>12.4} {stop:>12.4}");
        for column in table.columns() {
            let cell = column.row(row).map_or_else(String::new, |v| format_cell(&v));
            print!("  {cell}");
        }
        println!();
    }
    println!("{} rows", table.len());
}

fn format_cell(values: &ArrayValues) -> String {
    let items: Vec<String> = match values {
        ArrayValues::Bool(v) => v.iter().map(bool::to_string).collect(),
        ArrayValues::Int(v) => v.iter().map(i64::to_string).collect(),
        ArrayValues::UInt(v) => v.iter().map(u64::to_string).collect(),
        ArrayValues::Float(v) => v.iter().map(|x| format!("{x:.4}")).collect(),
        ArrayValues::Text(v) => v.clone(),
    };
    if items.len() == 1 {
        items.into_iter().collect()
    } else {
        format!("[{}]", items.join(", "))
    }
}

fn report_skipped(skipped: &[String]) {
    if !skipped.is_empty() {
        println!("skipped columns: {}", skipped.join(", "));
    }
}

fn cmd_assets(dandiset: &str, version: Option<&str>, lindi: bool, config: &Config) -> Result<()> {
    let catalog = catalog(version, config)?.with_lindi(lindi);
    for url in catalog.object_urls(dandiset)? {
        println!("{url}");
    }
    Ok(())
}

fn cmd_scan(
    dandiset: &str,
    version: Option<&str>,
    limit: Option<usize>,
    config: &Config,
) -> Result<()> {
    let catalog = catalog(version, config)?.with_lindi(true);
    let urls = catalog.object_urls(dandiset)?;
    let take = limit.unwrap_or(urls.len());
    info!("scanning {} of {} assets", take.min(urls.len()), urls.len());

    for url in urls.iter().take(take) {
        let session = Session::open(url, config)?;
        let nwb = session.nwb();
        let mut present = Vec::new();
        for what in Substructure::WELL_KNOWN {
            if nwb.has(what)? {
                present.push(what.to_string());
            }
        }
        println!("{url}\n    {}", present.join(" "));
    }
    Ok(())
}
