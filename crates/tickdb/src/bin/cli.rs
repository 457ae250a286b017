//! tickdb CLI
//!
//! Command-line front end for the embedded tick store: single-tick
//! inserts, range and tail queries, CSV import, and a synthetic-load
//! benchmark.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use rand::Rng;
use tickdb::{Series, Tick};
use tracing_subscriber::{fmt, EnvFilter};

/// tickdb CLI
#[derive(Parser, Debug)]
#[command(name = "tickdb-cli")]
#[command(about = "CLI for the tickdb columnar tick store")]
#[command(version)]
struct Args {
    /// Data directory holding one subdirectory per symbol
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert a single tick
    Insert {
        /// Symbol to insert into
        symbol: String,

        /// Tick timestamp
        timestamp: u64,

        /// Tick price
        price: f64,

        /// Tick volume
        volume: u64,
    },

    /// Query ticks within a timestamp range (inclusive)
    Query {
        /// Symbol to query
        symbol: String,

        /// Start timestamp
        start: u64,

        /// End timestamp
        end: u64,
    },

    /// Print the last N ticks
    Last {
        /// Symbol to query
        symbol: String,

        /// Number of ticks
        n: u64,
    },

    /// Append random ticks and report throughput
    Benchmark {
        /// Symbol to write into
        symbol: String,

        /// Number of ticks to generate
        #[arg(long, default_value_t = 100_000)]
        count: u64,
    },

    /// Import ticks from a CSV file (timestamp,price,volume)
    Import {
        /// Symbol to import into
        symbol: String,

        /// CSV file path; an optional header line is skipped
        file: PathBuf,
    },
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tickdb=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &args.command {
        Commands::Insert {
            symbol,
            timestamp,
            price,
            volume,
        } => {
            let series = Series::open(&args.data_dir, symbol)?;
            series.append(*timestamp, *price, *volume)?;
            series.sync()?;
            println!("Inserted tick for {symbol}");
        }

        Commands::Query { symbol, start, end } => {
            let series = Series::open(&args.data_dir, symbol)?;
            let ticks = series.query_range(*start, *end)?;
            print_ticks(&ticks);
        }

        Commands::Last { symbol, n } => {
            let series = Series::open(&args.data_dir, symbol)?;
            let ticks = series.query_last(*n)?;
            print_ticks(&ticks);
        }

        Commands::Benchmark { symbol, count } => {
            let series = Series::open(&args.data_dir, symbol)?;
            let ticks = generate_ticks(*count);

            let started = Instant::now();
            for chunk in ticks.chunks(10_000) {
                series.append_batch(chunk)?;
            }
            series.sync()?;
            let elapsed = started.elapsed();

            let rate = *count as f64 / elapsed.as_secs_f64();
            println!(
                "Appended {} ticks in {:.3}s ({:.0} ticks/s)",
                count,
                elapsed.as_secs_f64(),
                rate
            );
        }

        Commands::Import { symbol, file } => {
            let ticks = read_csv(file)?;
            let imported = ticks.len();

            let series = Series::open(&args.data_dir, symbol)?;
            series.append_batch(&ticks)?;
            series.sync()?;
            println!("Imported {imported} ticks into {symbol}");
        }
    }

    Ok(())
}

fn print_ticks(ticks: &[Tick]) {
    println!("Found {} results:", ticks.len());
    for tick in ticks {
        println!(
            "Timestamp: {} Price: {:.2} Volume: {}",
            tick.timestamp, tick.price, tick.volume
        );
    }
}

/// Random walk around a base price, uniform volumes, strictly increasing
/// timestamps.
fn generate_ticks(count: u64) -> Vec<Tick> {
    let mut rng = rand::thread_rng();
    let mut price = 100.0_f64;
    let mut ticks = Vec::with_capacity(count as usize);

    for i in 0..count {
        price = (price + rng.gen_range(-0.5..0.5)).max(0.01);
        ticks.push(Tick::new(i + 1, price, rng.gen_range(1..=1000)));
    }
    ticks
}

/// Parses `timestamp,price,volume` rows. A first line that fails to parse
/// is treated as a header and skipped; any later malformed line is an
/// error naming the line number.
fn read_csv(path: &Path) -> Result<Vec<Tick>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut ticks = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_csv_line(trimmed) {
            Some(tick) => ticks.push(tick),
            None if lineno == 0 => continue, // header line
            None => {
                return Err(format!("malformed CSV at line {}: {trimmed}", lineno + 1).into());
            }
        }
    }
    Ok(ticks)
}

fn parse_csv_line(line: &str) -> Option<Tick> {
    let mut fields = line.split(',');
    let timestamp = fields.next()?.trim().parse().ok()?;
    let price = fields.next()?.trim().parse().ok()?;
    let volume = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Tick::new(timestamp, price, volume))
}
