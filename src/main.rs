use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use phishguard::api::{self, AppState};
use phishguard::cli::{self, Cli, Commands, ProgressReporter};
use phishguard::config::Config;
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn buffer(&self) -> std::io::Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer()?.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer()?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        eprintln!("\nFor help, run: phishguard --help");
        process::exit(1);
    }
}

fn init_tracing(verbose: bool, log_format: &str, multi: Arc<MultiProgress>) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("phishguard=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("phishguard=info,warn"))
    };
    let writer = MultiProgressMakeWriter { multi };

    // Logs print above any active progress bars
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick one process-wide provider
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    // Writing the example config needs neither logging setup nor a valid config
    if let Commands::InitConfig { path, force } = &cli.command {
        cli::init_config(path, *force).await?;
        println!("Example configuration written to {:?}", path);
        println!("Set jwt_secret and the Gmail client credentials before deploying.");
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    let multi = Arc::new(MultiProgress::new());
    init_tracing(cli.verbose, &config.server.log_format, Arc::clone(&multi));

    tracing::info!(
        environment = %config.server.environment,
        config = ?cli.config,
        virustotal = config.intel.virustotal_api_key.is_some(),
        abuseipdb = config.intel.abuseipdb_api_key.is_some(),
        ipinfo = config.intel.ipinfo_token.is_some(),
        "phishguard starting"
    );

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let state = AppState::from_config(config).await?;
            api::serve(state, &bind).await?;
        }

        Commands::CreateAdmin {
            username,
            email,
            password,
            superadmin,
        } => {
            let admin = cli::create_admin(&config, &username, &email, &password, superadmin).await?;
            println!("Created {} account {} ({})", admin.role.as_str(), admin.username, admin.id);
        }

        Commands::Score { file, offline } => {
            let report = cli::score_file(&config, &file, offline).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Rescore => {
            let progress = ProgressReporter::new((*multi).clone());
            let summary = cli::rescore(&config, &progress).await?;
            println!("\n========================================");
            println!("Rescore Summary");
            println!("========================================");
            println!("Emails rescored: {}", summary.rescored);
            println!("Failures: {}", summary.failed);
            println!("========================================");
        }

        Commands::InitConfig { .. } => {}
    }

    Ok(())
}
