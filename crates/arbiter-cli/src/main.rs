//! Arbiter CLI
//!
//! Runs the judge as an HTTP service, or judges a single submission locally.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arbiter::{Config, EXAMPLE_CONFIG, Judge, JudgeRequest, TestCase, prepare_cgroup};
use clap::{Parser, Subcommand};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

mod server;

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(about = "A sandboxed judge for untrusted submissions")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: arbiter.toml)
        #[arg(short, long, default_value = "arbiter.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Serve the judge over HTTP
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Judge a source file against a JSON list of test cases
    Judge {
        /// Source file to judge
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., cpp17, python3)
        #[arg(short, long)]
        language: String,

        /// JSON array of {"input", "expectedOutput"} objects
        #[arg(short, long, value_name = "TESTS")]
        tests: PathBuf,

        /// Wall clock limit per test case in milliseconds
        #[arg(long)]
        time_limit_ms: Option<i64>,

        /// Memory limit per test case in megabytes
        #[arg(long)]
        memory_limit_mb: Option<i64>,

        /// Stop at the first failing test case
        #[arg(long)]
        fail_fast: bool,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    match &cli.config {
        Some(path) => info!(?path, "loading configuration"),
        None => debug!("using default configuration"),
    }
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let cgroup_ready = config.cgroup && setup_cgroup(&config);
    config.cgroup = cgroup_ready;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let max_body_bytes = config.server.max_body_bytes;
            let judge = Judge::with_cgroup(config, cgroup_ready);
            server::serve(judge, &bind, max_body_bytes).await
        }
        Commands::Judge {
            source,
            language,
            tests,
            time_limit_ms,
            memory_limit_mb,
            fail_fast,
        } => {
            let judge = Judge::with_cgroup(config, cgroup_ready);
            let request =
                build_request(&source, language, &tests, time_limit_ms, memory_limit_mb, fail_fast)
                    .await?;
            judge_file(&judge, request).await
        }
        Commands::Languages => {
            list_languages(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

/// Prepare the cgroup hierarchy; false means fall back to sampling
fn setup_cgroup(config: &Config) -> bool {
    match prepare_cgroup(&config.cg_root) {
        Ok(true) => {
            debug!("cgroup hierarchy ready");
            true
        }
        Ok(false) => {
            warn!("cgroup support unavailable (memory controller not found), falling back to sampled RSS");
            false
        }
        Err(e) => {
            warn!("cgroup setup failed: {e}, falling back to sampled RSS");
            false
        }
    }
}

async fn build_request(
    source: &Path,
    language: String,
    tests: &Path,
    time_limit_ms: Option<i64>,
    memory_limit_mb: Option<i64>,
    fail_fast: bool,
) -> Result<JudgeRequest> {
    let code = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;
    let test_cases = tokio::fs::read(tests)
        .await
        .context("failed to read test cases")?;
    let test_cases: Vec<TestCase> =
        serde_json::from_slice(&test_cases).context("failed to parse test cases")?;

    let mut request = JudgeRequest::new(language, code, test_cases);
    if let Some(ms) = time_limit_ms {
        request = request.with_time_limit_ms(ms);
    }
    if let Some(mb) = memory_limit_mb {
        request = request.with_memory_limit_mb(mb);
    }
    if fail_fast {
        request = request.with_fail_fast(true);
    }
    Ok(request)
}

async fn judge_file(judge: &Judge, request: JudgeRequest) -> Result<()> {
    info!(language = %request.language, cases = request.test_cases.len(), "judging");
    let result = judge.judge(request).await;

    // verdict on stdout, logs on stderr
    let json = serde_json::to_string_pretty(&result).context("failed to encode result")?;
    println!("{json}");

    if result.is_accepted() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    for language in server::language_list(&config.registry()) {
        let kind = if language.compiled {
            "compiled"
        } else {
            "interpreted"
        };
        println!("  {:<15} {} ({})", language.id, language.name, kind);
    }
}

fn show_config(config: &Config) {
    let limits = &config.default_limits;
    println!("Default resource limits:");
    println!("  Time limit: {:?} ms", limits.time_limit_ms);
    println!("  Memory limit: {:?} MB", limits.memory_limit_mb);
    println!("  Stack limit: {:?} MB", limits.stack_limit_mb);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Max output: {:?} bytes", limits.max_output_bytes);
    println!("  Max file size: {:?} KB", limits.max_file_size_kb);
    println!("  Max open files: {:?}", limits.max_open_files);
    println!();
    println!("Sandbox:");
    println!("  Deny network: {}", config.sandbox.deny_network);
    println!("  Confine filesystem: {}", config.sandbox.confine_filesystem);
    println!("  Read-only paths: {}", config.sandbox.readonly_paths.len());
    println!("  Strict isolation: {}", config.sandbox.strict_isolation);
    println!("  Nice: {}", config.sandbox.nice);
    println!("  Run as uid: {:?}", config.sandbox.uid);
    println!();
    println!("Judge:");
    println!("  Workers: {}", config.worker_count());
    println!("  Fail fast: {}", config.judge.fail_fast);
    println!("  Comparison: {:?}", config.judge.comparison);
    println!("  Request deadline: {:?} ms", config.judge.request_deadline_ms);
    println!();
    println!("Scratch root: {}", config.scratch_root.display());
    println!(
        "cgroup: {}",
        if config.cgroup {
            config.cg_root.display().to_string()
        } else {
            "off".to_string()
        }
    );
    println!("Bind: {}", config.server.bind);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
