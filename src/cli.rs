use crate::config::{load_global_settings, load_settings, Settings};
use crate::runtime::{
    host_state, run_host, shutdown_wait_timeout, stop_running_host, HostState, StatePaths,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Stop,
    Status,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "stop" => CliVerb::Stop,
        "status" => CliVerb::Status,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: clawkeeper <command> [--config <path>]".to_string(),
        "Commands:".to_string(),
        "  run       Run the host in the foreground until stopped".to_string(),
        "  stop      Ask the running host to stop and wait for it".to_string(),
        "  status    Show whether a host owns the state root".to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub verb: CliVerb,
    pub config: Option<PathBuf>,
}

pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut verb = None;
    let mut config = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            config = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
        } else if verb.is_none() {
            verb = Some(parse_cli_verb(arg));
        } else {
            return Err(format!("unexpected argument `{arg}`"));
        }
    }
    Ok(CliArgs {
        verb: verb.unwrap_or(CliVerb::Help),
        config,
    })
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let parsed = parse_args(&args)?;
    match parsed.verb {
        CliVerb::Help => Ok(cli_help_lines().join("\n")),
        CliVerb::Unknown => Err(format!(
            "unknown command `{}`\n{}",
            args.first().map(String::as_str).unwrap_or(""),
            cli_help_lines().join("\n")
        )),
        CliVerb::Run => {
            let settings = resolve_settings(&parsed)?;
            run_host(&settings).map_err(|err| err.to_string())?;
            Ok("host stopped".to_string())
        }
        CliVerb::Stop => {
            let settings = resolve_settings(&parsed)?;
            let paths = StatePaths::new(&settings.state_root);
            // Allow the host its own shutdown window plus time to exit.
            let wait = shutdown_wait_timeout() + Duration::from_secs(5);
            let pid = stop_running_host(&paths, wait).map_err(|err| err.to_string())?;
            Ok(format!("stopped host pid={pid}"))
        }
        CliVerb::Status => {
            let settings = resolve_settings(&parsed)?;
            let paths = StatePaths::new(&settings.state_root);
            let state = host_state(&paths).map_err(|err| err.to_string())?;
            Ok(match state {
                HostState::Running { pid } => format!("running pid={pid}"),
                HostState::Stale => "not running (stale lock)".to_string(),
                HostState::NotRunning => "not running".to_string(),
            })
        }
    }
}

fn resolve_settings(args: &CliArgs) -> Result<Settings, String> {
    let loaded = match &args.config {
        Some(path) => load_settings(path),
        None => load_global_settings(),
    };
    loaded.map_err(|err| err.to_string())
}
