use std::env;

use tagsweep_server::ServerBuilder;
use tagsweep_server::config::loader::load_config;

/// Where the config path came from, for the startup log line.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    Flag,
    Env,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag => write!(f, "--config"),
            Self::Env => write!(f, "TAGSWEEP_CONFIG"),
            Self::Default => write!(f, "default"),
        }
    }
}

const DEFAULT_CONFIG_PATH: &str = "tagsweep.toml";

#[tokio::main]
async fn main() {
    load_dotenv();
    tagsweep_server::observability::init_tracing();

    let (config_path, source) = config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %config_path, source = %source, "configuration loaded");

    tagsweep_server::observability::apply_logging_level(&cfg.logging.level);

    let server = match ServerBuilder::new().with_config(cfg).build().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Server initialization failed: {e}");
            std::process::exit(2);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("Server error: {err}");
        std::process::exit(1);
    }
}

/// `.env` is optional; only a present-but-unreadable file is worth a warning.
fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("Warning: ignoring .env: {e}"),
    }
}

/// `--config <path>` beats `TAGSWEEP_CONFIG`, which beats `tagsweep.toml`.
fn config_path() -> (String, ConfigSource) {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(path) = args
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| pair[1].clone())
    {
        return (path, ConfigSource::Flag);
    }

    match env::var("TAGSWEEP_CONFIG") {
        Ok(path) if !path.is_empty() => (path, ConfigSource::Env),
        _ => (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default),
    }
}
