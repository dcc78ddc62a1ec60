use batcher::config::Config as BatcherConfig;
use launcher::LaunchSettings;
use serde::Deserialize;
use std::fs::File;

fn default_prefix() -> String {
    "fanout".into()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Settings for `launch` and the listing commands.
    #[serde(default)]
    pub launch: LaunchSettings,
    /// Required by `serve`.
    pub batcher: Option<BatcherConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use launcher::{ResponsePolicy, TransportKind};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn empty_config() {
        let tmp = write_tmp_file("{}");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.common, CommonConfig::default());
        assert_eq!(config.launch, LaunchSettings::default());
        assert!(config.batcher.is_none());
    }

    #[test]
    fn batcher_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://public@sentry.example.com/1
            launch:
                default_regions: [us-east-1, us-west-2]
            batcher:
                listener:
                    host: 0.0.0.0
                    port: 3000
                admin_listener:
                    host: 127.0.0.1
                    port: 3001
                launch:
                    transport: tcp
                    response_policy: strict
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "fanout");
        assert_eq!(config.launch.default_regions, vec!["us-east-1", "us-west-2"]);

        let batcher = config.batcher.expect("batcher config");
        assert_eq!(batcher.listener.port, 3000);
        assert_eq!(batcher.launch.transport, TransportKind::Tcp);
        assert_eq!(batcher.launch.response_policy, ResponsePolicy::Strict);
        assert!(batcher.validate().is_ok());
    }

    #[test]
    fn missing_file() {
        let result = Config::from_file(std::path::Path::new("/nonexistent/fanout.yaml"));
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn invalid_yaml() {
        let tmp = write_tmp_file("launch: [unterminated");
        let result = Config::from_file(tmp.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
