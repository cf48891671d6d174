// Flatfile member lookup
// Resolves the static list of candidate peers a node contacts at startup

use std::{
    fs::File,
    io::{BufRead, BufReader},
    net::{IpAddr, SocketAddr},
    path::Path,
};

use tracing::{debug, info, warn};

use rill_common::{Result, RillError};

use crate::model::Configuration;

/// Reads candidate peers from `rill.cluster.members` or a flatfile.
///
/// The flatfile holds one `ip[:port]` per line; blank lines and lines starting
/// with `#` are skipped. A bare ip takes this node's port.
pub struct FlatfileLookup {
    config: Configuration,
}

impl FlatfileLookup {
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    fn read_flatfile(path: &str) -> Result<Vec<String>> {
        let path = Path::new(path);
        if !path.exists() {
            warn!("Flatfile not found: {}", path.display());
            return Err(RillError::ConfigError(format!(
                "flatfile not found: {}",
                path.display()
            )));
        }

        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines().map_while(std::result::Result::ok) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(line.to_string());
        }
        Ok(entries)
    }

    /// Parse `ip:port` or a bare `ip`
    pub fn parse_entry(entry: &str, default_port: u16) -> Result<SocketAddr> {
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            return Ok(addr);
        }
        entry
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, default_port))
            .map_err(|_| RillError::ConfigError(format!("invalid flatfile entry '{}'", entry)))
    }

    /// Load the candidate list; an absent list and flatfile means discovery is off
    pub fn load(&self) -> Result<Vec<SocketAddr>> {
        let default_port = self.config.node_port();

        let mut entries = self.config.member_list();
        if entries.is_empty()
            && let Some(path) = self.config.flatfile_path()
        {
            entries = Self::read_flatfile(&path)?;
        }

        let mut addresses = Vec::with_capacity(entries.len());
        for entry in &entries {
            let addr = Self::parse_entry(entry, default_port)?;
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }

        if addresses.is_empty() {
            debug!("No flatfile configured");
        } else {
            info!(count = addresses.len(), "Loaded flatfile members");
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn config_with(key: &str, value: &str) -> Configuration {
        let config = config::Config::builder()
            .set_default(key, value)
            .unwrap()
            .set_default("rill.node.port", 7000)
            .unwrap()
            .build()
            .unwrap();
        Configuration::from_config(config)
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(
            FlatfileLookup::parse_entry("10.1.1.1:9000", 1).unwrap(),
            "10.1.1.1:9000".parse().unwrap()
        );
        assert_eq!(
            FlatfileLookup::parse_entry("10.1.1.1", 1234).unwrap(),
            "10.1.1.1:1234".parse().unwrap()
        );
        assert!(FlatfileLookup::parse_entry("host-name", 1).is_err());
    }

    #[test]
    fn test_load_flatfile_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cluster members").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "127.0.0.1:7001").unwrap();
        writeln!(file, "  127.0.0.2  ").unwrap();
        writeln!(file, "127.0.0.1:7001").unwrap();

        let lookup = FlatfileLookup::new(config_with(
            "rill.cluster.flatfile",
            file.path().to_str().unwrap(),
        ));
        let members = lookup.load().unwrap();
        assert_eq!(
            members,
            vec![
                "127.0.0.1:7001".parse::<SocketAddr>().unwrap(),
                "127.0.0.2:7000".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_missing_flatfile_is_error() {
        let lookup = FlatfileLookup::new(config_with(
            "rill.cluster.flatfile",
            "/nonexistent/rill/flatfile",
        ));
        assert!(lookup.load().is_err());
    }

    #[test]
    fn test_no_sources_is_empty() {
        let lookup = FlatfileLookup::new(config_with("rill.cluster.name", "x"));
        assert!(lookup.load().unwrap().is_empty());
    }
}
