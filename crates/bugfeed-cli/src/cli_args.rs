use std::path::PathBuf;

use bugfeed_runtime::{FieldProjection, PushFeedRuntimeConfig, DEFAULT_API_BASE};
use bugfeed_timeline::SortOrder;
use clap::{Args, Parser, Subcommand, ValueEnum};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
/// Enumerates supported `CliSortOrder` values.
pub enum CliSortOrder {
    Ascending,
    Descending,
}

impl From<CliSortOrder> for SortOrder {
    fn from(value: CliSortOrder) -> Self {
        match value {
            CliSortOrder::Ascending => SortOrder::Ascending,
            CliSortOrder::Descending => SortOrder::Descending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Parser)]
#[command(
    name = "bugfeed",
    about = "Live bug timelines fed by a tracker push service",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub runtime: RuntimeArgs,

    #[arg(
        long = "log-level",
        env = "BUGFEED_LOG_LEVEL",
        value_enum,
        help = "Default log level when RUST_LOG is unset"
    )]
    pub log_level: Option<CliLogLevel>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(
        long = "websocket-endpoint",
        env = "BUGFEED_WEBSOCKET_ENDPOINT",
        help = "Push service websocket url. Live updates are disabled when unset."
    )]
    pub websocket_endpoint: Option<String>,

    #[arg(
        long = "api-base",
        env = "BUGFEED_API_BASE",
        default_value = DEFAULT_API_BASE,
        help = "Tracker REST api base url"
    )]
    pub api_base: String,

    #[arg(
        long = "cache-dir",
        env = "BUGFEED_CACHE_DIR",
        default_value = ".bugfeed/bugs",
        help = "Directory holding one cached JSON document per bug"
    )]
    pub cache_dir: PathBuf,

    #[arg(
        long = "request-timeout-ms",
        env = "BUGFEED_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "retry-max-attempts",
        env = "BUGFEED_RETRY_MAX_ATTEMPTS",
        default_value_t = 3,
        value_parser = parse_positive_usize
    )]
    pub retry_max_attempts: usize,

    #[arg(
        long = "retry-base-delay-ms",
        env = "BUGFEED_RETRY_BASE_DELAY_MS",
        default_value_t = 500,
        value_parser = parse_positive_u64
    )]
    pub retry_base_delay_ms: u64,

    #[arg(
        long = "reconnect-interval-ms",
        env = "BUGFEED_RECONNECT_INTERVAL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Fixed interval between reconnect attempts after an abnormal close"
    )]
    pub reconnect_interval_ms: u64,

    #[arg(
        long = "sort-order",
        env = "BUGFEED_SORT_ORDER",
        value_enum,
        default_value = "ascending"
    )]
    pub sort_order: CliSortOrder,

    #[arg(
        long = "include-field",
        value_delimiter = ',',
        help = "Override the fields requested from the tracker"
    )]
    pub include_fields: Vec<String>,

    #[arg(
        long = "event-buffer",
        default_value_t = 256,
        value_parser = parse_positive_usize
    )]
    pub event_buffer: usize,
}

impl RuntimeArgs {
    pub fn to_runtime_config(&self) -> PushFeedRuntimeConfig {
        let field_projection = if self.include_fields.is_empty() {
            FieldProjection::default()
        } else {
            FieldProjection::new(self.include_fields.iter().cloned(), Vec::<String>::new())
        };
        PushFeedRuntimeConfig {
            websocket_endpoint: self
                .websocket_endpoint
                .clone()
                .filter(|endpoint| !endpoint.trim().is_empty()),
            api_base: self.api_base.clone(),
            cache_dir: self.cache_dir.clone(),
            request_timeout_ms: self.request_timeout_ms,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            reconnect_interval: std::time::Duration::from_millis(self.reconnect_interval_ms),
            field_projection,
            sort_order: self.sort_order.into(),
            event_buffer: self.event_buffer,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Subscribe to bugs and print every applied change as a JSON line.
    Watch {
        #[arg(required = true, value_delimiter = ',')]
        bugs: Vec<u64>,
    },
    /// Print the merged, read-partitioned timeline of one bug.
    Timeline {
        bug: u64,
        #[arg(long, help = "Treat details as fetched after the bug was opened")]
        delayed: bool,
        #[arg(
            long = "field-catalog",
            help = "JSON array of {name, description} field metadata"
        )]
        field_catalog: Option<PathBuf>,
    },
    /// Move the last-viewed watermark of a cached bug.
    MarkViewed {
        bug: u64,
        #[arg(long, help = "RFC 3339 timestamp; defaults to now")]
        at: Option<String>,
    },
    /// Set or clear the starred flag of a cached bug.
    Star {
        bug: u64,
        #[arg(long)]
        clear: bool,
    },
    /// Set or clear the unread flag of a cached bug.
    Unread {
        bug: u64,
        #[arg(long)]
        clear: bool,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bugfeed_timeline::SortOrder;
    use clap::Parser;

    use super::{Cli, CliCommand, CliLogLevel};

    #[test]
    fn unit_defaults_map_to_runtime_config() {
        let cli = Cli::try_parse_from([
            "bugfeed",
            "--api-base",
            "https://tracker.example.org/rest",
            "--cache-dir",
            "/tmp/bugfeed-cache",
            "timeline",
            "42",
        ])
        .expect("parse");
        let config = cli.runtime.to_runtime_config();
        assert_eq!(config.api_base, "https://tracker.example.org/rest");
        assert_eq!(config.reconnect_interval, Duration::from_millis(30_000));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.sort_order, SortOrder::Ascending);
        assert!(config
            .field_projection
            .include()
            .iter()
            .any(|field| field == "comments"));
        assert!(matches!(
            cli.command,
            CliCommand::Timeline {
                bug: 42,
                delayed: false,
                ..
            }
        ));
    }

    #[test]
    fn functional_watch_accepts_comma_separated_bugs_and_overrides() {
        let cli = Cli::try_parse_from([
            "bugfeed",
            "--websocket-endpoint",
            "wss://push.example.org/",
            "--sort-order",
            "descending",
            "--include-field",
            "id,summary,comments",
            "--log-level",
            "debug",
            "watch",
            "10,20",
        ])
        .expect("parse");
        let config = cli.runtime.to_runtime_config();
        assert_eq!(
            config.websocket_endpoint.as_deref(),
            Some("wss://push.example.org/")
        );
        assert_eq!(config.sort_order, SortOrder::Descending);
        assert_eq!(config.field_projection.include().len(), 3);
        assert_eq!(cli.log_level, Some(CliLogLevel::Debug));
        match cli.command {
            CliCommand::Watch { bugs } => assert_eq!(bugs, vec![10, 20]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn regression_zero_valued_numeric_flags_are_rejected() {
        let error = Cli::try_parse_from([
            "bugfeed",
            "--reconnect-interval-ms",
            "0",
            "watch",
            "1",
        ])
        .expect_err("zero interval");
        assert!(error.to_string().contains("value must be greater than 0"));
        assert!(Cli::try_parse_from(["bugfeed", "watch"]).is_err());
    }
}
