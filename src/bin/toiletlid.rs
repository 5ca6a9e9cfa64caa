//! Command-line control of a Whale smart toilet cover.

use clap::{Parser, Subcommand, ValueEnum};
use log::error;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use toiletlid::config::{ApplianceConfig, Config};
use toiletlid::device::DeviceClient;
use toiletlid::error::{MiioError, Result};
use toiletlid::platform::{ApplianceRegistry, ServiceCall};

/// Local miIO control of Xiaomi Whale smart toilet lids.
#[derive(Parser, Debug)]
#[command(name = "toiletlid")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML file with `[[appliances]]` tables.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Appliance address; selects the entry when a config file is given.
    #[arg(long, global = true)]
    host: Option<String>,

    /// 32-character hex token, used without a config file.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Model identifier override.
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Per-call timeout in seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the `miIO.info` reply.
    Info,
    /// Poll the appliance and print its entity state.
    Status,
    /// Switch self-clean on or off.
    SelfClean { state: Switch },
    /// Switch the night light on or off.
    Light { state: Switch },
    /// Send a raw command.
    Raw {
        command: String,
        /// Parameters; a single one may be a JSON list such as `[1,2]`.
        params: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error {}: {}", e.code(), e);
            ExitCode::from(exit_status(e.code()))
        }
    }
}

/// Error codes do not fit in a process exit status; keep them distinct from
/// success.
fn exit_status(code: u32) -> u8 {
    match (code % 256) as u8 {
        0 => 1,
        status => status,
    }
}

async fn run(args: Args) -> Result<()> {
    let appliance = select_appliance(&args)?;

    let call = match args.command {
        Command::Info => {
            let mut client = DeviceClient::new(appliance.identity()?)?;
            let info = client.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }
        Command::Status => None,
        Command::SelfClean { state } => Some(ServiceCall::SelfClean {
            on: state.is_on(),
            entity_ids: None,
        }),
        Command::Light { state } => Some(ServiceCall::Light {
            on: state.is_on(),
            entity_ids: None,
        }),
        Command::Raw { command, params } => Some(ServiceCall::SendCommand {
            command,
            params: raw_params(params),
            entity_ids: None,
        }),
    };

    let mut registry = ApplianceRegistry::new();
    registry.add(&appliance).await?;

    if let Some(call) = call {
        let outcomes = registry.dispatch(&call).await?;
        if outcomes.iter().any(|o| !o.success) {
            return Err(MiioError::Device {
                code: -1,
                message: "command was not acknowledged".into(),
            });
        }
    }
    for entity in registry.iter() {
        println!("{}", serde_json::to_string_pretty(&entity.snapshot())?);
    }
    Ok(())
}

fn select_appliance(args: &Args) -> Result<ApplianceConfig> {
    let mut appliance = match (&args.config, &args.host, &args.token) {
        (Some(path), host, _) => {
            let config = Config::from_file(path)?;
            match host {
                Some(h) => config.appliance(h).cloned().ok_or_else(|| {
                    MiioError::Config(format!("{} has no appliance {}", path.display(), h))
                })?,
                None if config.appliances.len() == 1 => config.appliances[0].clone(),
                None => {
                    return Err(MiioError::Config(format!(
                        "{} lists {} appliances; choose one with --host",
                        path.display(),
                        config.appliances.len()
                    )));
                }
            }
        }
        (None, Some(host), Some(token)) => ApplianceConfig::new(host.as_str(), token.as_str()),
        _ => {
            return Err(MiioError::Config(
                "either --config or both --host and --token are required".into(),
            ));
        }
    };

    if let Some(model) = &args.model {
        appliance.model = Some(model.clone());
    }
    if let Some(timeout) = args.timeout {
        appliance.timeout_secs = timeout;
    }
    Ok(appliance)
}

/// A lone argument is passed through for normalization; several are each
/// read as JSON when possible and as strings otherwise.
fn raw_params(params: Vec<String>) -> Option<Value> {
    match params.len() {
        0 => None,
        1 => params.into_iter().next().map(|p| Value::Array(vec![Value::String(p)])),
        _ => Some(Value::Array(
            params
                .into_iter()
                .map(|p| serde_json::from_str(&p).unwrap_or(Value::String(p)))
                .collect(),
        )),
    }
}
