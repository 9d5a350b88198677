use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::ops::{Add, Setup, Start};

#[derive(Parser, Debug)]
#[command(name = "bunkerd")]
#[command(about = "Remote signing bunker for NIP-46 clients")]
pub struct Args {
    /// Path to the config/vault file (defaults to ~/.bunker.json)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialise the config file and whitelist admin npubs
    Setup(Setup),
    /// Encrypt an nsec under a passphrase and store it in the vault
    Add(Add),
    /// Unlock stored keys and run the bunker
    Start(Start),
}
