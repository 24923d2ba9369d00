//! atex CLI: distributed test executor utilities.

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use atex::connection::LocalConnection;
use atex::provisioner::{HelperChannel, HelperReply, HelperRequest};

#[derive(Parser)]
#[command(name = "atex")]
#[command(about = "Distributed test executor", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Utilities for atex-virt-helper
    ///
    /// These execute '--helper-exec' as a command to communicate with. It
    /// can simply be 'atex-virt-helper' directly, or any other proxy
    /// command, such as 'ssh user@host atex-virt-helper', or even just
    /// 'ssh host' if the host has ForceCommand to execute the helper.
    Shvirt {
        /// Helper command to exec
        #[arg(short = 'e', long = "helper-exec", required = true)]
        helper_exec: String,

        #[command(subcommand)]
        command: ShvirtCommands,
    },
}

#[derive(Subcommand)]
enum ShvirtCommands {
    /// List active domain reservations
    Reservations,

    /// Run an arbitrary virsh command via the helper
    Virsh {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Shvirt {
            helper_exec,
            command,
        } => shvirt(&helper_exec, command).await,
    }
}

/// One request/response round-trip over a freshly spawned helper.
async fn helper_query(helper_exec: &str, request: &HelperRequest) -> Result<HelperReply> {
    let argv = shell_words::split(helper_exec).context("bad --helper-exec")?;
    if argv.is_empty() {
        bail!("'--helper-exec' needs to be provided");
    }
    let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
    let mut channel = HelperChannel::spawn(&LocalConnection, &argv)?;
    let reply = channel.request(request).await?;
    channel.terminate().await;
    Ok(reply)
}

async fn shvirt(helper_exec: &str, command: ShvirtCommands) -> Result<ExitCode> {
    match command {
        ShvirtCommands::Reservations => {
            let reply = helper_query(helper_exec, &HelperRequest::Reservations).await?;
            if !reply.success {
                bail!("failed: {}", reply.reply_str());
            }
            let domains: BTreeMap<String, String> = reply.domains.unwrap_or_default();
            let width = domains.keys().map(String::len).max().unwrap_or(0);
            for (domain, status) in &domains {
                println!("{domain:<width$}  {status}");
            }
            Ok(ExitCode::SUCCESS)
        }
        ShvirtCommands::Virsh { args } => {
            let reply = helper_query(helper_exec, &HelperRequest::Virsh { args }).await?;
            print!("{}", reply.reply_str());
            Ok(if reply.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
