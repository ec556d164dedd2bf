//! HistorIA command-line front-end.
//!
//! Interactive fiction in chapters: the model writes, you choose.
//!
//! ```bash
//! GEMINI_API_KEY=... cargo run -p historia -- --data-dir ./data
//! ```
//!
//! Environment (a `.env` file is honoured):
//! - `HISTORIA_DATA_DIR` - where stories and settings live (default `./data`)
//! - `HISTORIA_LOG` - tracing filter, e.g. `historia_core=debug` (default `warn`)
//! - `GEMINI_API_KEY` - seeds the stored license key when none is saved yet

mod headless;

use historia_core::{FileStore, GeminiGenerator, GenerationConfig, Narrator, StoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_LOG_FILTER: &str = "warn";

/// Process configuration gathered from the environment and arguments.
#[derive(Debug, Clone)]
struct AppConfig {
    data_dir: PathBuf,
    log_filter: String,
    api_key: Option<String>,
}

impl AppConfig {
    fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            data_dir: var("HISTORIA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            log_filter: var("HISTORIA_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            api_key: var("GEMINI_API_KEY"),
        }
    }

    /// Command-line flags override the environment.
    fn with_args(mut self, args: &[String]) -> Self {
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    if let Some(dir) = args.get(i + 1) {
                        self.data_dir = PathBuf::from(dir);
                        i += 1;
                    }
                }
                "--log" => {
                    if let Some(filter) = args.get(i + 1) {
                        self.log_filter = filter.clone();
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        self
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config = AppConfig::from_env().with_args(&args);
    init_tracing(&config.log_filter);

    let store = Arc::new(FileStore::open(&config.data_dir)?);
    info!(data_dir = %config.data_dir.display(), "opened story store");

    if let Some(key) = config.api_key.as_deref() {
        if store.credential()?.is_none() {
            store.set_credential(Some(key))?;
            info!("stored license key from GEMINI_API_KEY");
        }
    }

    let generator = GeminiGenerator::new(Arc::clone(&store)).with_config(GenerationConfig::default());
    let narrator = Narrator::new(store, generator);

    headless::run_headless(narrator).await.map_err(|e| e.into())
}

fn print_help() {
    println!("HistorIA - interactive fiction with AI-written chapters");
    println!();
    println!("USAGE:");
    println!("    historia [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --data-dir <PATH>   Story and settings directory (default: ./data)");
    println!("    --log <FILTER>      Tracing filter written to stderr (default: warn)");
    println!("    -h, --help          Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    HISTORIA_DATA_DIR, HISTORIA_LOG, GEMINI_API_KEY");
}
