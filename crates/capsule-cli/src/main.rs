//! `capsule` command-line entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;

use capsule_core::vm::ModulePolicy;
use capsule_core::{Executor, ExecutorConfig, VmManager};
use capsule_server::{run as run_server, ServerConfig};

#[derive(FromArgs)]
/// Embedded JavaScript capability host.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Run(RunArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// Start the HTTP control server.
struct ServeArgs {
    /// address to listen on (default: 127.0.0.1:8080)
    #[argh(option, default = "String::from(\"127.0.0.1:8080\")")]
    addr: String,

    /// per-execution timeout in seconds (default: 300)
    #[argh(option, default = "300")]
    timeout: u64,

    /// comma-separated list of the only modules scripts may use
    #[argh(option)]
    allow: Option<String>,

    /// comma-separated list of modules scripts may not use
    #[argh(option)]
    deny: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// Execute a script file and print its outcome.
struct RunArgs {
    /// path to the script
    #[argh(positional)]
    file: PathBuf,

    /// per-execution timeout in seconds (default: 300)
    #[argh(option, default = "300")]
    timeout: u64,

    /// comma-separated list of the only modules scripts may use
    #[argh(option)]
    allow: Option<String>,

    /// comma-separated list of modules scripts may not use
    #[argh(option)]
    deny: Option<String>,
}

fn parse_policy(allow: Option<String>, deny: Option<String>) -> Result<ModulePolicy, String> {
    let split = |s: String| -> Vec<String> {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    };
    match (allow, deny) {
        (Some(_), Some(_)) => Err("--allow and --deny are mutually exclusive".into()),
        (Some(allow), None) => Ok(ModulePolicy::Allow(split(allow))),
        (None, Some(deny)) => Ok(ModulePolicy::Deny(split(deny))),
        (None, None) => Ok(ModulePolicy::AllowAll),
    }
}

fn parse_timeout(seconds: u64) -> Result<Duration, String> {
    if seconds == 0 {
        return Err("--timeout must be greater than zero".into());
    }
    Ok(Duration::from_secs(seconds))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Args = argh::from_env();
    let result = match args.command {
        Command::Serve(serve) => cmd_serve(serve).await,
        Command::Run(run) => cmd_run(run).await,
    };
    match result {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_serve(args: ServeArgs) -> Result<ExitCode, String> {
    let addr: SocketAddr = args
        .addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {e}", args.addr))?;
    let config = ServerConfig {
        addr,
        timeout: parse_timeout(args.timeout)?,
        policy: parse_policy(args.allow, args.deny)?,
    };
    run_server(config).await.map_err(|e| e.to_string())?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode, String> {
    let source = std::fs::read_to_string(&args.file)
        .map_err(|e| format!("failed to read {}: {e}", args.file.display()))?;

    let policy = parse_policy(args.allow, args.deny)?;
    let manager = Arc::new(VmManager::with_default_modules(policy));
    let executor = Executor::new(
        manager,
        ExecutorConfig {
            timeout: parse_timeout(args.timeout)?,
        },
        tokio::runtime::Handle::current(),
    )
    .map_err(|e| e.to_string())?;

    let outcome = executor.execute(source).await;
    print!("{}", outcome.output);
    if let Some(result) = &outcome.result {
        println!("{result}");
    }

    if outcome.detached {
        tracing::info!("script is serving; press ctrl-c to stop");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("failed to wait for ctrl-c: {e}"))?;
        executor.shutdown();
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(error) = &outcome.error {
        eprintln!("error: {error}");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
