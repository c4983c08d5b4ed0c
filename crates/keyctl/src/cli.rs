use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shared::error::CommonError;

use crate::commands::{self, DecryptParams, KeyManagementContext};

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "keyctl", about = "Inspect and rotate envelope encryption keys")]
pub struct Cli {
    /// Encryption configuration file
    #[arg(long, global = true, default_value = "keyctl.yaml")]
    config: PathBuf,

    /// Database url, overriding `database_url` from the configuration file
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the configured keys bound to a canary
    Keys,
    /// Verify the stored data is decryptable with the configured keys
    Check,
    /// Encrypt a value under the active key
    Encrypt {
        plaintext: String,
    },
    /// Decrypt a value
    Decrypt(DecryptParams),
    /// Re-encrypt every stored value under the active key
    Rotate {
        /// Values fetched per page, overriding `rotation.page_size`
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Show keyctl version
    Version,
}

fn log_error_chain(err: &dyn Error) {
    let mut current = err.source();

    while let Some(e) = current {
        eprintln!("Caused by: {e}");
        current = e.source();
    }
}

fn handle_error(err: &CommonError) -> ! {
    eprintln!("Error [{}]: {err}", err.name());
    log_error_chain(err);
    ::std::process::exit(1);
}

pub async fn run_cli(cli: Cli) -> Result<(), anyhow::Error> {
    if let Commands::Version = cli.command {
        println!("keyctl version: {CLI_VERSION}");
        return Ok(());
    }

    let ctx = match KeyManagementContext::load(&cli.config, cli.database_url.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => handle_error(&e),
    };

    let cmd_res = match cli.command {
        Commands::Keys => commands::cmd_keys(&ctx),
        Commands::Check => commands::cmd_check(&ctx).await,
        Commands::Encrypt { plaintext } => commands::cmd_encrypt(&ctx, &plaintext).await,
        Commands::Decrypt(params) => commands::cmd_decrypt(&ctx, params).await,
        Commands::Rotate { page_size } => commands::cmd_rotate(&ctx, page_size).await,
        Commands::Version => Ok(()),
    };

    if let Err(e) = cmd_res {
        handle_error(&e);
    }
    Ok(())
}
