use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};

use crate::{
    config::{Settings, DEVICES_EXAMPLE},
    error::Result,
};

/// The command line interface for the device broker.
///
/// Values given here override the settings file.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a settings file (RON).
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Path to the device list.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to listen on.
    #[arg(short, long)]
    pub address: Option<IpAddr>,

    /// Verbosity: 0 (nothing) to 3 (every message).
    #[arg(short, long)]
    pub verbose: Option<u8>,

    /// Log file, `-` for standard output.
    #[arg(short, long)]
    pub logfile: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The settings file (or the defaults), with command line overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::new_from_path(path)?,
            None => Settings::default(),
        };

        if let Some(config) = &self.config {
            settings.devices = config.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(address) = self.address {
            settings.address = address;
        }
        if let Some(verbose) = self.verbose {
            settings.verbose = verbose;
        }
        if let Some(logfile) = &self.logfile {
            settings.logfile = logfile.clone();
        }

        Ok(settings)
    }
}

/// Commands available in the command line interface.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[command(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Debug, Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a settings file's contents.
    Settings,

    /// Show an example of a device list.
    Devices,
}

/// Run a subcommand.
pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Examples(Examples::Settings) => {
            println!("{}", Settings::example().serialize_pretty()?);
        }
        Commands::Examples(Examples::Devices) => {
            print!("{DEVICES_EXAMPLE}");
        }
    }

    Ok(())
}
