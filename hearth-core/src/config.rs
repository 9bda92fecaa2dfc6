//! dhcp server configs

pub mod cli {
    //! Parse from either cli or env var

    /// default dhcpv6 multicast group
    pub static ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
    /// Default dhcpv4 addr
    pub static DEFAULT_V4_ADDR: &str = "0.0.0.0:67"; // default dhcpv4 port is 67
    /// Default dhcpv6 addr
    pub static DEFAULT_V6_ADDR: &str = "[::]:547"; // default dhcpv6 port is 547
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// Default bound for the raw packet ingress queue
    pub const DEFAULT_QUEUE_SIZE: usize = 10_000;
    /// Max live messages -- the more live messages we hold onto the more
    /// memory is used. Past some point the timeout will be hit anyway and
    /// raising this stops helping.
    pub const DEFAULT_MAX_LIVE_MSGS: usize = 1_000;
    /// Default timeout, we must respond within this window or we will time out
    pub const DEFAULT_TIMEOUT: u64 = 3;
    /// Max transactions a hook may hold suspended at once
    pub const DEFAULT_PARKED_PACKET_LIMIT: usize = 256;
    /// Seconds a parked transaction may wait before it is dropped
    pub const DEFAULT_PARKED_PACKET_TIMEOUT: u64 = 120;
    /// How often expired leases are swept
    pub const DEFAULT_RECLAIM_INTERVAL: u64 = 10;
    /// Max leases reclaimed per sweep
    pub const DEFAULT_RECLAIM_BATCH: usize = 100;
    /// Expired backlog size that triggers declined-lease recovery
    pub const DEFAULT_RECLAIM_HIGH_WATER: usize = 500;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "hearth-dhcp-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/hearth/config.yaml";
    /// default directory for the lease journals
    pub const DEFAULT_LEASE_DIR: &str = "/var/lib/hearth";
    /// default log level. Can use this argument or HEARTH_LOG env var
    pub const DEFAULT_HEARTH_LOG: &str = "info";

    use std::{
        net::{Ipv6Addr, SocketAddr},
        path::PathBuf,
        time::Duration,
    };

    pub use clap::Parser;
    use proto::{v4, v6};

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "hearth", bin_name = "hearth", about, long_about = None)]
    /// parses from cli & environment var. hearth will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to hearth's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the v4 address to listen on
        #[clap(long, env, value_parser, default_value = DEFAULT_V4_ADDR)]
        pub v4_addr: SocketAddr,
        /// the v6 address to listen on
        #[clap(long, env, value_parser, default_value = DEFAULT_V6_ADDR)]
        pub v6_addr: SocketAddr,
        /// address of the control/metrics api
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// default timeout, hearth will respond within this window or drop
        #[clap(long, env, value_parser, default_value_t = DEFAULT_TIMEOUT)]
        pub timeout: u64,
        /// max live messages before new messages will begin to be dropped
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MAX_LIVE_MSGS)]
        pub max_live_msgs: usize,
        /// bound on the raw packet ingress queue
        #[clap(long, env, value_parser, default_value_t = DEFAULT_QUEUE_SIZE)]
        pub queue_size: usize,
        /// transaction worker tasks; defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub workers: Option<usize>,
        /// max transactions hooks may hold parked at once
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PARKED_PACKET_LIMIT)]
        pub parked_packet_limit: usize,
        /// seconds before a parked transaction is dropped
        #[clap(long, env, value_parser, default_value_t = DEFAULT_PARKED_PACKET_TIMEOUT)]
        pub parked_packet_timeout: u64,
        /// seconds between expired-lease sweeps
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECLAIM_INTERVAL)]
        pub reclaim_interval: u64,
        /// max leases reclaimed per sweep
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECLAIM_BATCH)]
        pub reclaim_batch: usize,
        /// expired backlog that additionally triggers declined-lease recovery
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECLAIM_HIGH_WATER)]
        pub reclaim_high_water: usize,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// tokio runtime threads; defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_HEARTH_LOG)]
        pub hearth_log: String,
        /// directory holding the lease journals
        #[clap(short, long, env, value_parser, default_value = DEFAULT_LEASE_DIR)]
        pub lease_dir: PathBuf,
    }

    impl Config {
        /// Create new timeout as `Duration`
        pub fn timeout(&self) -> Duration {
            Duration::from_secs(self.timeout)
        }

        /// how often the reclaim timer fires
        pub fn reclaim_interval(&self) -> Duration {
            Duration::from_secs(self.reclaim_interval)
        }

        /// base wait before a parked transaction is dropped
        pub fn parked_packet_timeout(&self) -> Duration {
            Duration::from_secs(self.parked_packet_timeout)
        }

        /// are we bound to the default dhcpv4 port?
        pub fn is_default_port_v4(&self) -> bool {
            self.v4_addr.port() == v4::SERVER_PORT
        }

        /// are we bound to the default dhcpv6 port?
        pub fn is_default_port_v6(&self) -> bool {
            self.v6_addr.port() == v6::SERVER_PORT
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// log as "json", "pretty", or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Tracing/logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber. Log level comes from `hearth_log`,
        /// format from the LOG_FORMAT env var.
        pub fn parse(hearth_log: &str) -> Result<Self> {
            let log_frmt =
                std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            let filter = EnvFilter::try_new(hearth_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
