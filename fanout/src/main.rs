mod config;

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{Config, LoggingConfig, MetricsConfig};
use launcher::config::{function_name_from_env, process_env};
use launcher::payload::event_payload;
use launcher::{
    Credentials, InvocationMode, LaunchError, LaunchRequest, LaunchSettings, Operation,
    ResponsePolicy, launchpar, request_once,
};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_metrics;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "fanout", version, about = "Invoke serverless functions at high fan-out")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Invoke $LAMBDA_FUNCTION `launches` times in every region
    Launch(LaunchArgs),
    /// Run the batching service from the `batcher` config section
    Serve,
    /// List the functions visible in a region
    ListFunctions {
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },
    /// List the published versions of $LAMBDA_FUNCTION
    ListVersions {
        #[arg(long, default_value = "us-east-1")]
        region: String,
    },
}

#[derive(Args)]
struct LaunchArgs {
    /// Invocations per region
    launches: usize,

    /// Region to launch in, repeatable. Defaults to the configured regions.
    #[arg(long = "region")]
    regions: Vec<String>,

    /// Payload template; the first `##ID##` becomes the invocation index.
    /// Built from the EVENT_* environment when omitted.
    #[arg(long)]
    payload: Option<String>,

    #[arg(long)]
    qualifier: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Event)]
    mode: Mode,

    /// Fail on any unsuccessful response
    #[arg(long)]
    strict: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    RequestResponse,
    Event,
    DryRun,
}

impl From<Mode> for InvocationMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::RequestResponse => InvocationMode::RequestResponse,
            Mode::Event => InvocationMode::Event,
            Mode::DryRun => InvocationMode::DryRun,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Environment(#[from] launcher::ConfigError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Batcher(#[from] batcher::errors::BatcherError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
    #[error("config has no `{0}` section")]
    MissingSection(&'static str),
    #[error("request returned status {0}")]
    Status(u16),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("fanout: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let _sentry = init_logging(config.common.logging.as_ref());
    if let Err(e) = init_metrics(config.common.metrics.as_ref()) {
        tracing::error!(error = %e, "metrics setup failed");
        return ExitCode::FAILURE;
    }

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fanout failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.and_then(|logging| match logging.sentry_dsn.parse::<sentry::types::Dsn>() {
        Ok(dsn) => Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            ..Default::default()
        })),
        Err(e) => {
            eprintln!("fanout: ignoring invalid sentry dsn: {e}");
            None
        }
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: Option<&MetricsConfig>) -> Result<(), CliError> {
    let Some(metrics) = metrics else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(metrics.statsd_host.clone(), metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    describe_metrics(launcher::metrics_defs::ALL_METRICS);
    describe_metrics(batcher::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

fn run(command: CliCommand, config: Config) -> Result<(), CliError> {
    match command {
        CliCommand::Launch(args) => launch(args, config.launch),
        CliCommand::Serve => {
            let batcher_config = config.batcher.ok_or(CliError::MissingSection("batcher"))?;
            tracing::info!("starting batcher");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(batcher::run(batcher_config))?;
            Ok(())
        }
        CliCommand::ListFunctions { region } => {
            list(&config.launch, &region, Operation::ListFunctions)
        }
        CliCommand::ListVersions { region } => {
            let function_name = function_name_from_env()?;
            list(
                &config.launch,
                &region,
                Operation::ListVersions { function_name },
            )
        }
    }
}

fn launch(args: LaunchArgs, mut settings: LaunchSettings) -> Result<(), CliError> {
    // Everything the environment must provide is read before any connection.
    let function_name = function_name_from_env()?;
    let credentials = Credentials::from_env()?;
    let payload = match args.payload {
        Some(payload) => payload,
        None => event_payload(process_env)?,
    };

    if args.strict {
        settings.response_policy = ResponsePolicy::Strict;
    }
    let request = LaunchRequest {
        launches: args.launches,
        function_name,
        credentials,
        payload,
        qualifier: args.qualifier,
        mode: args.mode.into(),
        regions: args.regions,
    };

    let report = launchpar(&settings, &request)?;
    tracing::info!(
        sent = report.sent(),
        connect_failed = report.connect_failed(),
        succeeded = report.succeeded(),
        unsuccessful = report.unsuccessful(),
        send_ms = report.send_duration.as_millis() as u64,
        "launch finished"
    );
    Ok(())
}

fn list(settings: &LaunchSettings, region: &str, operation: Operation) -> Result<(), CliError> {
    let credentials = Credentials::from_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let response = runtime.block_on(request_once(settings, region, &credentials, &operation))?;

    println!("{}", String::from_utf8_lossy(response.body()));
    if !response.status().is_success() {
        return Err(CliError::Status(response.status().as_u16()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_launch() {
        let cli = Cli::try_parse_from([
            "fanout",
            "launch",
            "250",
            "--region",
            "us-east-1",
            "--region",
            "eu-west-1",
            "--payload",
            r###"{"id":"##ID##"}"###,
            "--strict",
        ])
        .unwrap();
        let CliCommand::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.launches, 250);
        assert_eq!(args.regions, vec!["us-east-1", "eu-west-1"]);
        assert_eq!(args.payload.as_deref(), Some(r###"{"id":"##ID##"}"###));
        assert_eq!(args.mode, Mode::Event);
        assert!(args.strict);
    }

    #[test]
    fn parses_mode_and_config() {
        let cli = Cli::try_parse_from([
            "fanout",
            "launch",
            "1",
            "--mode",
            "request-response",
            "--config",
            "/etc/fanout.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fanout.yaml")));
        let CliCommand::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(InvocationMode::from(args.mode), InvocationMode::RequestResponse);
    }

    #[test]
    fn launch_count_is_required() {
        assert!(Cli::try_parse_from(["fanout", "launch"]).is_err());
        assert!(Cli::try_parse_from(["fanout", "launch", "many"]).is_err());
    }

    #[test]
    fn list_commands_default_region() {
        let cli = Cli::try_parse_from(["fanout", "list-functions"]).unwrap();
        assert!(matches!(
            cli.command,
            CliCommand::ListFunctions { ref region } if region == "us-east-1"
        ));

        let args = ["fanout", "list-versions", "--region", "ap-south-1"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            CliCommand::ListVersions { ref region } if region == "ap-south-1"
        ));
    }

    #[test]
    fn serve_needs_batcher_section() {
        let result = run(CliCommand::Serve, Config::default());
        assert!(matches!(result, Err(CliError::MissingSection("batcher"))));
    }
}
