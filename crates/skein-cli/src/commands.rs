//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the live scheduler over a DAG directory
    Scheduler {
        /// Directory of DAG definition files
        #[arg(short, long)]
        dags_dir: Option<String>,

        /// PostgreSQL connection string; in-memory state when omitted
        #[arg(long)]
        database_url: Option<String>,

        /// Seconds between evaluation cycles
        #[arg(long)]
        tick: Option<u64>,
    },

    /// Run one DAG over a date range to completion
    Backfill {
        /// DAG id
        dag_id: String,

        /// Start of the range (YYYY-MM-DD or RFC 3339)
        #[arg(short, long, value_parser = crate::handlers::parse_date)]
        start: chrono::DateTime<chrono::Utc>,

        /// End of the range, inclusive (YYYY-MM-DD or RFC 3339)
        #[arg(short, long, value_parser = crate::handlers::parse_date)]
        end: chrono::DateTime<chrono::Utc>,

        /// Directory of DAG definition files
        #[arg(short, long)]
        dags_dir: Option<String>,

        /// PostgreSQL connection string; in-memory state when omitted
        #[arg(long)]
        database_url: Option<String>,

        /// Waive depends-on-past for the earliest date in the range
        #[arg(short = 'I', long)]
        ignore_first_depends_on_past: bool,

        /// Waive all task dependency checks
        #[arg(long)]
        ignore_task_deps: bool,

        /// Re-run dates that already have a finished run
        #[arg(long)]
        reset_dag_runs: bool,
    },

    /// Validate DAG definition files
    Validate {
        /// DAG file or directory
        #[arg(default_value = "dags")]
        path: String,
    },

    /// Manage resource pools
    Pools {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum PoolCommands {
    /// List pools and slot usage
    List {
        /// PostgreSQL connection string
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Create a pool or resize an existing one
    Set {
        /// Pool name
        name: String,

        /// Total slots
        slots: u32,

        /// PostgreSQL connection string
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
