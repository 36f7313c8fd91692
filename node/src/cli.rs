//! # CLI Interface
//!
//! `pod-node <config.toml>`: one positional path, no flags. Everything else
//! lives in the configuration file.

use clap::Parser;
use std::path::PathBuf;

/// Proof-of-Devotion chain node.
#[derive(Parser, Debug)]
#[command(name = "pod-node", about = "Proof-of-Devotion chain node")]
pub struct PodNodeCli {
    /// Path to the node configuration file (TOML).
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_exactly_one_path() {
        let cli = PodNodeCli::try_parse_from(["pod-node", "node.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("node.toml"));

        assert!(PodNodeCli::try_parse_from(["pod-node"]).is_err());
        assert!(PodNodeCli::try_parse_from(["pod-node", "a.toml", "b.toml"]).is_err());
        assert!(PodNodeCli::try_parse_from(["pod-node", "--verbose", "a.toml"]).is_err());
    }
}
