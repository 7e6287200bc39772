use std::path::PathBuf;

use clap::Parser;

#[derive(Clone, Parser)]
#[command(about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    ///
    /// Missing or unreadable files are ignored. Every setting can also be given through environment variables prefixed
    /// with `MINIGRPC_`, such as `MINIGRPC_LISTEN_ADDRESS`, which take precedence over the file.
    #[arg(long, short = 'c', default_value = "/etc/minigrpc/minigrpc.yaml")]
    pub config: PathBuf,
}
