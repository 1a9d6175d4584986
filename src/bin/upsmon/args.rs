use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Reads settings from a YAML (or JSON) file.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// upsd address as `host:port`, overriding the config file.
    #[arg(short, long)]
    pub(crate) address: Option<String>,
    /// upsd user name, overriding the config file.
    #[arg(short, long)]
    pub(crate) username: Option<String>,
    /// File holding the upsd password, overriding the config file.
    #[arg(short, long)]
    pub(crate) password_file: Option<PathBuf>,
    /// Prints the UPS state once and exits instead of monitoring.
    #[arg(short, long, default_value_t)]
    pub(crate) once: bool,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
