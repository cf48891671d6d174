// Server configuration sources
// Layers conf/application.yml, RILL environment variables and command line flags

use clap::Parser;
use config::{Config, Environment};

use rill_core::Configuration;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line flags; each one overrides the matching configuration key
#[derive(Debug, Default, Parser)]
#[command(name = "rill-server", version, about = "Run one Rill cluster node")]
pub struct Cli {
    /// Cluster name; nodes only join clouds with the same name
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    /// Address to bind and advertise
    #[arg(long = "ip")]
    pub ip: Option<String>,
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// File listing candidate peers, one ip[:port] per line
    #[arg(short = 'f', long = "flatfile")]
    pub flatfile: Option<String>,
    /// Comma separated candidate peers; wins over --flatfile
    #[arg(short = 'm', long = "members")]
    pub members: Option<String>,
    /// Join as an ephemeral client instead of a member
    #[arg(long = "client")]
    pub client: bool,
    /// As a client, stop the whole cluster when this process goes away
    #[arg(long = "controlling", requires = "client")]
    pub controlling: bool,
    /// Members to wait for before the cloud locks
    #[arg(long = "expected-size")]
    pub expected_size: Option<u32>,
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,
}

/// Parse the process arguments and build the layered configuration
pub fn load_configuration() -> anyhow::Result<Configuration> {
    build_configuration(&Cli::parse())
}

pub fn build_configuration(args: &Cli) -> anyhow::Result<Configuration> {
    let config_file = if args.config.is_empty() {
        DEFAULT_CONFIG_FILE
    } else {
        args.config.as_str()
    };

    let mut builder = Config::builder()
        .add_source(config::File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("rill")
                .separator(".")
                .keep_prefix(true)
                .try_parsing(true),
        );

    if let Some(v) = &args.name {
        builder = builder.set_override("rill.cluster.name", v.as_str())?;
    }
    if let Some(v) = &args.ip {
        builder = builder.set_override("rill.node.ip", v.as_str())?;
    }
    if let Some(v) = args.port {
        builder = builder.set_override("rill.node.port", v as i64)?;
    }
    if let Some(v) = &args.flatfile {
        builder = builder.set_override("rill.cluster.flatfile", v.as_str())?;
    }
    if let Some(v) = &args.members {
        builder = builder.set_override("rill.cluster.members", v.as_str())?;
    }
    if args.client {
        builder = builder.set_override("rill.node.client", true)?;
    }
    if args.controlling {
        builder = builder.set_override("rill.node.controlling", true)?;
    }
    if let Some(v) = args.expected_size {
        builder = builder.set_override("rill.cluster.expected-size", v as i64)?;
    }

    Ok(Configuration::from_config(builder.build()?))
}
