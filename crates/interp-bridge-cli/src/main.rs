//! interp-bridge - command-line driver for interpreter endpoints.
//!
//! `call` and `exec` launch (or reuse) a supervised Python endpoint and talk
//! to it; `serve` hosts the Rust `arith` handler set on a port so the same
//! protocol can be exercised without an interpreter.

mod arith;
mod serve;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use interp_bridge::{
    BridgeConfig, CommandState, InterpreterCommand, MainModule, Marshaller,
    ServiceCache, ServiceInstance, ServiceKey, StatementBatch, Value,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "interp-bridge")]
#[command(about = "RPC bridge to a supervised interpreter process")]
struct Args {
    /// Enable debug logging and ask endpoints for debug context on failures
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a Rust handler set on a port
    Serve {
        /// Accepted for launch compatibility with interpreter endpoints
        #[arg(short = 'u')]
        unbuffered: bool,

        /// Handler set to serve (`arith`)
        module: String,

        /// Port to listen on
        port: u16,
    },

    /// Call one handler and print its JSON result
    Call {
        /// Interpreter executable
        #[arg(long, default_value = "python3")]
        python: PathBuf,

        /// Project name; with the interpreter it selects the instance and port
        #[arg(long, default_value = "cli")]
        project: String,

        /// File whose functions are registered before the call
        #[arg(long)]
        source: Option<PathBuf>,

        /// Handler name
        handler: String,

        /// Positional arguments as JSON (bare words are passed as strings)
        args: Vec<String>,
    },

    /// Run statements and print the requested outputs as a JSON object
    Exec {
        #[arg(long, default_value = "python3")]
        python: PathBuf,

        #[arg(long, default_value = "cli")]
        project: String,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Named input, `name=json`
        #[arg(long = "input", value_name = "NAME=JSON")]
        inputs: Vec<String>,

        /// Name to read back after the statements ran
        #[arg(long = "output", value_name = "NAME")]
        outputs: Vec<String>,

        /// Statements, run in order
        #[arg(required = true)]
        statements: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries results and the ready line.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            unbuffered: _,
            module,
            port,
        } => {
            let code = serve::run(&module, port).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Call {
            python,
            project,
            source,
            handler,
            args: raw_args,
        } => {
            let call_args = raw_args
                .iter()
                .map(|raw| parse_value(raw))
                .collect::<Result<Vec<_>>>()?;
            let source = source
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))
                })
                .transpose()?;
            let result = call(python, project, source, &handler, call_args, args.debug).await?;
            println!("{}", serde_json::to_string_pretty(&result.to_wire())?);
            Ok(())
        }
        Command::Exec {
            python,
            project,
            timeout,
            inputs,
            outputs,
            statements,
        } => {
            let mut batch = StatementBatch::new().statements(statements);
            for input in &inputs {
                let (name, raw) = input
                    .split_once('=')
                    .ok_or_else(|| anyhow!("input '{}' is not NAME=JSON", input))?;
                batch = batch.input(name, parse_value(raw)?);
            }
            for output in outputs {
                batch = batch.output(output);
            }
            if let Some(secs) = timeout {
                batch = batch.with_timeout(Duration::try_from_secs_f64(secs)?);
            }
            let result = exec(python, project, batch, args.debug).await?;
            println!("{}", serde_json::to_string_pretty(&result.to_wire())?);
            Ok(())
        }
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Ok(Value::from_wire(json)?),
        Err(_) => Ok(Value::from(raw)),
    }
}

/// Replace every array reference with its inline contents.
fn inline_arrays(value: Value, marshaller: &Marshaller) -> interp_bridge::Result<Value> {
    match value {
        Value::ArrayRef(reference) => Ok(marshaller.load(&reference)?.to_value()),
        Value::List(items) => items
            .into_iter()
            .map(|item| inline_arrays(item, marshaller))
            .collect::<interp_bridge::Result<Vec<_>>>()
            .map(Value::List),
        Value::Map(map) => map
            .into_iter()
            .map(|(k, v)| Ok((k, inline_arrays(v, marshaller)?)))
            .collect::<interp_bridge::Result<_>>()
            .map(Value::Map),
        other => Ok(other),
    }
}

fn prepare(python: PathBuf, project: String) -> Result<(ServiceCache, ServiceKey, InterpreterCommand)> {
    let deploy_dir = std::env::temp_dir().join(BridgeConfig::SPILL_DIR_NAME);
    let command = MainModule::command(&python, &deploy_dir)?;
    let key = ServiceKey::new(project, python.display().to_string());
    Ok((ServiceCache::default(), key, command))
}

async fn call(
    python: PathBuf,
    project: String,
    source: Option<String>,
    handler: &str,
    args: Vec<Value>,
    debug: bool,
) -> Result<Value> {
    let (cache, key, command) = prepare(python, project)?;
    let service = cache.get_or_create(&key, &command).await?;
    debug!("Calling {} on {} (port {})", handler, key, service.port());

    let outcome = call_on(&service, source.as_deref(), handler, args, debug).await;
    cache.clear().await;
    outcome
}

async fn call_on(
    service: &ServiceInstance,
    source: Option<&str>,
    handler: &str,
    args: Vec<Value>,
    debug: bool,
) -> Result<Value> {
    let client = service.client();
    if let Some(source) = source {
        let names = defined_functions(source);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        client.register_source(source, &names, debug).await?;
    }
    // Array references in the response are only valid until the next request.
    match client.request(handler, args, debug).await? {
        Ok(value) => Ok(inline_arrays(value, client.marshaller())?),
        Err(remote) => Err(anyhow!("{}", remote.formatted_traceback())),
    }
}

async fn exec(python: PathBuf, project: String, batch: StatementBatch, debug: bool) -> Result<Value> {
    let (cache, key, command) = prepare(python, project)?;
    let service = cache.get_or_create(&key, &command).await?;
    let channel = service.commands().with_debug(debug);

    let pending = channel.sync_exec(batch).await;
    let state = pending.state();
    let outcome = pending.outcome();
    let result = match (state, outcome) {
        (CommandState::Completed, Some(Ok(outputs))) => {
            Ok(inline_arrays(Value::Map(outputs), channel.marshaller())?)
        }
        (_, Some(Err(e))) => match e.remote() {
            Some(remote) => Err(anyhow!("{}", remote.formatted_traceback())),
            None => Err(e.into()),
        },
        (state, _) => Err(anyhow!("command ended in state {:?} without outputs", state)),
    };

    cache.clear().await;
    result
}

/// Top-level `def` names in `source`.
fn defined_functions(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|line| line.strip_prefix("def "))
        .filter_map(|rest| rest.split('(').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_accepts_json_and_words() {
        assert_eq!(parse_value("3").unwrap(), Value::Int(3));
        assert_eq!(
            parse_value("[1, 2.5]").unwrap(),
            Value::List(vec![Value::Int(1), Value::Float(2.5)])
        );
        assert_eq!(parse_value("hello").unwrap(), Value::from("hello"));
    }

    #[test]
    fn test_defined_functions() {
        let names = defined_functions(arith::ARITH_SOURCE);
        assert_eq!(names, vec!["plus", "minus"]);
    }

    #[test]
    fn test_cli_parses_serve_argv() {
        let args = Args::try_parse_from(["interp-bridge", "serve", "-u", "arith", "4100"]).unwrap();
        match args.command {
            Command::Serve { module, port, .. } => {
                assert_eq!(module, "arith");
                assert_eq!(port, 4100);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_exec_requires_statements() {
        assert!(Args::try_parse_from(["interp-bridge", "exec"]).is_err());
    }
}
