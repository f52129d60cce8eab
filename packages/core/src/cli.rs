use clap::{Parser, Subcommand};

/// Carbon metrics CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "carbon-metrics",
    version,
    about = "Cached carbon emissions metrics for published content"
)]
pub struct Cli {
    /// SQLite database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Measurement API base URL (overrides MEASUREMENT_API_URL)
    #[arg(long)]
    pub measurement_api_url: Option<String>,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Site-wide totals and average emissions
    Stats,

    /// Heaviest measured pages
    Heaviest {
        /// Number of pages; 0 uses the configured default
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Published pages without a measurement, grouped by type
    Untested,

    /// Emissions of a single item
    Emissions {
        id: u64,
    },

    /// Schedule measurement for items and process the queue
    Schedule {
        #[arg(required = true)]
        ids: Vec<u64>,
    },

    /// Measure the untested backlog in the background until Ctrl-C
    Worker {
        /// Seconds between backlog scans
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },

    /// Driving distance and tree equivalents for a gram figure
    Equivalents {
        grams: f64,
    },
}
