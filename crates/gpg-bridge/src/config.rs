use anyhow::{Result, bail};
use gpg_bridge_protocol::default_listen_addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{GpgAgent, ListingFormat};

/// Largest number of results a single command produces (`sign`).
pub const MAX_RESULTS_PER_COMMAND: usize = 2;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Loopback address to accept WebSocket upgrades on.
    pub listen: SocketAddr,
    /// OpenPGP executable to delegate to.
    pub gpg_program: PathBuf,
    /// Optional GnuPG home directory, forwarded as `--homedir`.
    pub homedir: Option<PathBuf>,
    /// Which `--list-keys` output to request and parse.
    pub listing_format: ListingFormat,
    /// Bound of each command's result queue.
    pub result_queue_capacity: usize,
    /// How long in-flight sessions may run after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            gpg_program: PathBuf::from("gpg"),
            homedir: None,
            listing_format: ListingFormat::Human,
            result_queue_capacity: 5,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.listen.ip().is_loopback() {
            bail!(
                "refusing to listen on non-loopback address {}: the bridge has no caller authentication",
                self.listen
            );
        }
        if self.result_queue_capacity < MAX_RESULTS_PER_COMMAND {
            bail!(
                "result queue capacity must be >= {MAX_RESULTS_PER_COMMAND}, got {}",
                self.result_queue_capacity
            );
        }
        if self.gpg_program.as_os_str().is_empty() {
            bail!("gpg program must not be empty");
        }
        Ok(())
    }

    /// Build the agent adapter this configuration describes.
    pub fn agent(&self) -> GpgAgent {
        let agent =
            GpgAgent::new(self.gpg_program.clone()).with_listing_format(self.listing_format);
        match &self.homedir {
            Some(homedir) => agent.with_homedir(homedir.clone()),
            None => agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_bridge() {
        let config = BridgeConfig::default();
        assert_eq!(config.listen.to_string(), "127.0.0.1:5151");
        assert_eq!(config.result_queue_capacity, 5);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_loopback_listen() {
        let config = BridgeConfig {
            listen: "0.0.0.0:5151".parse().unwrap(),
            ..BridgeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("non-loopback"));
    }

    #[test]
    fn accepts_ipv6_loopback() {
        let config = BridgeConfig {
            listen: "[::1]:5151".parse().unwrap(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_queue_smaller_than_sign_output() {
        let config = BridgeConfig {
            result_queue_capacity: 1,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_program() {
        let config = BridgeConfig {
            gpg_program: PathBuf::new(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_uses_program() {
        let config = BridgeConfig {
            gpg_program: PathBuf::from("/usr/local/bin/gpg2"),
            ..BridgeConfig::default()
        };
        assert_eq!(config.agent().program(), "/usr/local/bin/gpg2");
    }

    #[test]
    fn human_listing_is_the_default() {
        assert_eq!(BridgeConfig::default().listing_format, ListingFormat::Human);
    }
}
