use clap::{Parser, Subcommand};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "trials-backend")]
#[command(about = "Clinical trial analytics backend (DuckDB + Tantivy)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a ClinicalTrials.gov JSON export into DuckDB and build the facility search index.
    Import(ImportArgs),
    /// Serve the analytics HTTP API (requires a completed import).
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ImportArgs {
    /// Backend data directory (DuckDB database, Tantivy index, meta.json).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// ClinicalTrials.gov JSON export to load (an array of study objects).
    #[arg(long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/data/clinical_trials.json"))]
    pub input: String,

    /// Clear the store and search index without importing anything.
    #[arg(long)]
    pub reset: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Backend data directory (DuckDB database and Tantivy index).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,
}
