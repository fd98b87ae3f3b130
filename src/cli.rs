use clap::Parser;

/// Native Lyrion Music Server player with Diretta output.
#[derive(Parser, Debug)]
#[command(name = "slim2diretta", version, about)]
pub struct Args {
    /// LMS server address (omit to auto-discover)
    #[arg(short, long)]
    pub server: Option<std::net::Ipv4Addr>,

    /// Slimproto control port
    #[arg(short, long, default_value_t = 3483)]
    pub port: u16,

    /// Player name shown in the server UI
    #[arg(short, long, default_value = "slim2diretta")]
    pub name: String,

    /// MAC address (default: derived from the player name)
    #[arg(short, long)]
    pub mac: Option<String>,

    /// Diretta target index (1, 2, 3...)
    #[arg(short, long)]
    pub target: Option<usize>,

    /// List available targets and exit
    #[arg(short = 'l', long)]
    pub list_targets: bool,

    /// SDK thread priority mode (0 = no real-time request)
    #[arg(long, default_value_t = 1)]
    pub thread_mode: i32,

    /// Packet cycle time in microseconds (default: computed from MTU and format)
    #[arg(long)]
    pub cycle_time: Option<u32>,

    /// MTU override in bytes (0 = auto; jumbo frames: 9014, 16128)
    #[arg(long, default_value_t = 0)]
    pub mtu: u32,

    /// Transfer mode: auto, varmax, varauto, fixauto, random
    #[arg(long, default_value = "auto")]
    pub transfer_mode: String,

    /// Info packet cycle in microseconds
    #[arg(long, default_value_t = 100_000)]
    pub info_cycle: u32,

    /// Minimum cycle time for the random transfer mode (microseconds)
    #[arg(long, default_value_t = 0)]
    pub cycle_min_time: u32,

    /// Target profile limit time in microseconds (0 = self profile)
    #[arg(long, default_value_t = 200)]
    pub profile_limit: u32,

    /// Maximum PCM sample rate advertised to the server
    #[arg(long, default_value_t = 768_000)]
    pub max_rate: u32,

    /// Disable DSD support (dsf/dff capabilities)
    #[arg(long)]
    pub no_dsd: bool,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol() {
        let args = Args::parse_from(["slim2diretta"]);
        assert_eq!(args.port, 3483);
        assert_eq!(args.name, "slim2diretta");
        assert_eq!(args.max_rate, 768_000);
        assert!(!args.no_dsd);
        assert!(args.server.is_none());
        assert!(args.target.is_none());
    }

    #[test]
    fn short_flags_parse() {
        let args = Args::parse_from([
            "slim2diretta",
            "-s",
            "192.168.1.10",
            "-t",
            "2",
            "-n",
            "Living Room",
            "-v",
        ]);
        assert_eq!(args.server, Some("192.168.1.10".parse().unwrap()));
        assert_eq!(args.target, Some(2));
        assert_eq!(args.name, "Living Room");
        assert!(args.verbose);
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["slim2diretta", "-v", "-q"]).is_err());
    }
}
