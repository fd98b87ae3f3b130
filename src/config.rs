//! Immutable runtime configuration assembled from the CLI.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::cli::Args;
use crate::diretta::{DirettaConfig, TransferMode};
use crate::slimproto;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: Ipv4Addr,
    pub port: u16,
    pub player_name: String,
    pub mac: [u8; 6],
    pub max_sample_rate: u32,
    pub dsd_enabled: bool,
    pub diretta: DirettaConfig,
}

impl Config {
    /// Build the runtime configuration. `server` must already be resolved
    /// (given on the command line or found by discovery).
    pub fn from_args(args: &Args, server: Ipv4Addr) -> Result<Self> {
        let target_index = args
            .target
            .context("Diretta target required (--target <index>)")?;

        let mac = match &args.mac {
            Some(s) => slimproto::parse_mac(s)
                .with_context(|| format!("invalid MAC address: {s}"))?,
            None => slimproto::derive_mac(&args.name),
        };

        let transfer_mode = TransferMode::from_str(&args.transfer_mode)?;

        Ok(Self {
            server,
            port: args.port,
            player_name: args.name.clone(),
            mac,
            max_sample_rate: args.max_rate,
            dsd_enabled: !args.no_dsd,
            diretta: DirettaConfig {
                target_index,
                thread_mode: args.thread_mode,
                mtu: args.mtu,
                cycle_time_us: args.cycle_time.unwrap_or(10_000),
                cycle_auto: args.cycle_time.is_none(),
                transfer_mode,
                info_cycle_us: args.info_cycle,
                cycle_min_time_us: args.cycle_min_time,
                target_profile_limit_us: args.profile_limit,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn config_requires_a_target() {
        let args = Args::parse_from(["slim2diretta", "-s", "10.0.0.1"]);
        assert!(Config::from_args(&args, Ipv4Addr::new(10, 0, 0, 1)).is_err());
    }

    #[test]
    fn explicit_mac_overrides_derivation() {
        let args = Args::parse_from([
            "slim2diretta",
            "-s",
            "10.0.0.1",
            "-t",
            "1",
            "-m",
            "02:11:22:33:44:55",
        ]);
        let config = Config::from_args(&args, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(config.mac, [0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn manual_cycle_time_disables_auto() {
        let args = Args::parse_from([
            "slim2diretta",
            "-s",
            "10.0.0.1",
            "-t",
            "1",
            "--cycle-time",
            "5000",
        ]);
        let config = Config::from_args(&args, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert!(!config.diretta.cycle_auto);
        assert_eq!(config.diretta.cycle_time_us, 5000);

        let args = Args::parse_from(["slim2diretta", "-s", "10.0.0.1", "-t", "1"]);
        let config = Config::from_args(&args, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert!(config.diretta.cycle_auto);
    }

    #[test]
    fn dsd_follows_the_no_dsd_flag() {
        let args = Args::parse_from(["slim2diretta", "-s", "10.0.0.1", "-t", "1", "--no-dsd"]);
        let config = Config::from_args(&args, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert!(!config.dsd_enabled);
    }
}
