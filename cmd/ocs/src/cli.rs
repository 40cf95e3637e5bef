use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ocs", about = "Observatory control server", version)]
pub struct Options {
    /// Configuration files; later files override earlier ones.
    #[arg(short, long = "config", required = true, num_args = 1..)]
    pub config: Vec<PathBuf>,

    /// Name of the router section to serve (`router.<name>` in the config).
    #[arg(long, default_value = "front")]
    pub router_name: String,

    /// Log filter, e.g. `info` or `ocs_tree=debug`; `RUST_LOG` wins when
    /// set.
    #[arg(long, env = "OCS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
