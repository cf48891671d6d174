pub mod config;

pub use config::{Cli, build_configuration, load_configuration};
