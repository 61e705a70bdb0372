use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::CliLogLevel;

pub(crate) fn default_level_filter(level: Option<CliLogLevel>) -> LevelFilter {
    match level {
        None | Some(CliLogLevel::Warn) => LevelFilter::WARN,
        Some(CliLogLevel::Error) => LevelFilter::ERROR,
        Some(CliLogLevel::Info) => LevelFilter::INFO,
        Some(CliLogLevel::Debug) => LevelFilter::DEBUG,
        Some(CliLogLevel::Trace) => LevelFilter::TRACE,
    }
}

pub(crate) fn init_tracing(level: Option<CliLogLevel>) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level_filter(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::default_level_filter;
    use crate::cli_args::CliLogLevel;

    #[test]
    fn unit_default_level_is_warn_unless_overridden() {
        assert_eq!(default_level_filter(None), LevelFilter::WARN);
        assert_eq!(
            default_level_filter(Some(CliLogLevel::Debug)),
            LevelFilter::DEBUG
        );
    }
}
