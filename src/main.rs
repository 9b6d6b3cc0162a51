//! numux CLI: loads the config, wires the manager to the line renderer,
//! forwards shutdown signals and maps failures onto the exit code.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use numux::color;
use numux::config::{self, Platform, ResolvedConfig};
use numux::envfile;
use numux::events::Event;
use numux::filter;
use numux::interpolate;
use numux::manager::ProcessManager;
use numux::output::LineRenderer;
use numux::pty;
use numux::validate;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "numux",
    version,
    about = "Dependency-aware process orchestrator for local development"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to a config file (numux.yaml, numux.json, package.json).
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Run only these processes and their dependencies.
    #[arg(long)]
    only: Vec<String>,
    /// Run everything except these processes.
    #[arg(long)]
    exclude: Vec<String>,
    /// Stop all processes when any one exits.
    #[arg(long)]
    kill_others: bool,
    /// Stop all processes when any one exits with a failure.
    #[arg(long)]
    kill_others_on_fail: bool,
    /// Disable file watching for this run.
    #[arg(long)]
    no_watch: bool,
    /// Global auto-restart cap.
    #[arg(long)]
    max_restarts: Option<u32>,
    /// Global env file, or `false` to disable inheritance.
    #[arg(long)]
    env_file: Option<String>,
    /// Ad-hoc process definition `name=command` (repeatable).
    #[arg(long = "name")]
    name: Vec<String>,
    /// Ad-hoc shell commands, named by their leading word.
    #[arg(trailing_var_arg = true)]
    commands: Vec<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Write a starter numux.yaml.
    Init,
    /// Resolve the configuration and report problems.
    Validate,
    /// Run one configured process in the foreground.
    Exec {
        /// Process name from the config.
        name: String,
        /// Optional command override.
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
}

const INIT_TEMPLATE: &str = "\
processes:
  db:
    command: docker compose up db
    readyPattern: \"ready to accept connections\"
  migrate:
    command: npm run migrate
    persistent: false
    dependsOn: db
  api:
    command: npm run dev
    dependsOn: migrate
";

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let code = match cli.command.clone() {
        Some(Commands::Init) => {
            init_cmd()?;
            0
        }
        Some(Commands::Validate) => {
            validate_cmd(&cli)?;
            0
        }
        Some(Commands::Exec { name, command }) => exec_cmd(&cli, &name, &command).await?,
        None => run(cli).await?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<i32> {
    let (config, warnings) = resolve_config(&cli)?;
    for warning in &warnings {
        eprintln!("{}", color::yellow(&format!("[numux] warning: {warning}")));
    }

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let manager = ProcessManager::new(config)?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    manager.on(Box::new(move |event| {
        let _ = events_tx.send(event.clone());
    }));
    let mut renderer = LineRenderer::new(manager.config());
    let kill_others = manager.config().options.kill_others;
    let kill_others_on_fail = manager.config().options.kill_others_on_fail;

    let starter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.start_all(cols, rows).await;
        })
    };
    let mut shutdown = spawn_signal_listener();

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                renderer.handle(&event);
                if let Event::Exit { code, .. } = &event {
                    if !manager.is_stopping()
                        && (kill_others || (kill_others_on_fail && *code != Some(0)))
                    {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            manager.stop_all().await;
                        });
                    }
                }
                if manager.is_idle() {
                    break;
                }
            }
            _ = &mut shutdown => {
                eprintln!("{}", color::dim("[numux] shutting down"));
                manager.stop_all().await;
                break;
            }
        }
    }

    let _ = starter.await;
    while let Ok(event) = events.try_recv() {
        renderer.handle(&event);
    }
    Ok(if manager.any_failed() { 1 } else { 0 })
}

fn validate_cmd(cli: &Cli) -> Result<()> {
    let (config, warnings) = resolve_config(cli)?;
    for warning in &warnings {
        eprintln!("{}", color::yellow(&format!("[numux] warning: {warning}")));
    }
    println!("configuration OK ({} processes)", config.processes.len());
    Ok(())
}

fn init_cmd() -> Result<()> {
    let path = Path::new("numux.yaml");
    if path.exists() {
        bail!("numux.yaml already exists");
    }
    std::fs::write(path, INIT_TEMPLATE).context("failed to write numux.yaml")?;
    println!("created numux.yaml");
    Ok(())
}

async fn exec_cmd(cli: &Cli, name: &str, command_override: &[String]) -> Result<i32> {
    let (config, _) = resolve_config(cli)?;
    let Some(process) = config.processes.get(name) else {
        bail!("unknown process: {name}");
    };
    let command = if command_override.is_empty() {
        process.command.clone()
    } else {
        shell_words::join(command_override.iter().map(String::as_str))
    };

    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.insert("TERM".into(), "xterm-256color".into());
    if std::env::var_os("NO_COLOR").is_none() {
        env.insert("FORCE_COLOR".into(), "1".into());
    }
    for path in &process.env_files {
        env.extend(envfile::load_env_file(path)?);
    }
    env.extend(process.env.clone());

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let spawned = pty::spawn_shell(&command, process.cwd.as_deref(), &env, cols, rows)?;
    let handle = spawned.handle;
    let mut output = spawned.output;
    let pump = tokio::spawn(async move {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = output.recv().await {
            let _ = stdout.write_all(&chunk);
            let _ = stdout.flush();
        }
    });
    let mut child = spawned.child;
    let status = tokio::task::spawn_blocking(move || child.wait())
        .await
        .context("wait task failed")??;
    let _ = pump.await;
    drop(handle);
    Ok(status.exit_code() as i32)
}

/// Loads, merges, interpolates, validates and filters the configuration.
fn resolve_config(cli: &Cli) -> Result<(ResolvedConfig, Vec<String>)> {
    let raw = match &cli.config {
        Some(path) => Some(config::load_raw(path)?),
        None => match config::find_config(Path::new(".")) {
            Some(path) => Some(config::load_raw(&path)?),
            None => None,
        },
    };
    if raw.is_none() && cli.name.is_empty() && cli.commands.is_empty() {
        bail!("no processes defined (use numux.yaml or --name name=command)");
    }

    let raw = merge_cli_config(raw, cli)?;
    let raw = interpolate::interpolate(&raw)?;
    let validated = validate::validate(&raw)?;
    let config = filter::filter_by_platform(&validated.config, Platform::current())?;
    let config = filter::filter_only(&config, &split_names(&cli.only))?;
    let config = filter::filter_exclude(&config, &split_names(&cli.exclude))?;
    Ok((config, validated.warnings))
}

/// Folds `--name`, positional commands and global flag overrides into the
/// raw config value, ahead of interpolation and validation.
fn merge_cli_config(raw: Option<Value>, cli: &Cli) -> Result<Value> {
    let mut raw = raw.unwrap_or_else(|| serde_json::json!({}));
    let Some(root) = raw.as_object_mut() else {
        // Leave the type error to the validator's single clear message.
        return Ok(raw);
    };
    if !root.contains_key("processes") {
        root.insert("processes".into(), serde_json::json!({}));
    }

    for entry in &cli.name {
        let (name, command) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --name {entry}, expected name=command"))?;
        insert_process(root, name.trim(), command)?;
    }
    for command in &cli.commands {
        let base = command.split_whitespace().next().unwrap_or("cmd").to_string();
        let name = dedup_name(root, &base);
        insert_process(root, &name, command)?;
    }

    if cli.kill_others {
        root.insert("killOthers".into(), Value::Bool(true));
    }
    if cli.kill_others_on_fail {
        root.insert("killOthersOnFail".into(), Value::Bool(true));
    }
    if cli.no_watch {
        root.insert("noWatch".into(), Value::Bool(true));
    }
    if let Some(max) = cli.max_restarts {
        root.insert("maxRestarts".into(), Value::from(max));
    }
    if let Some(env_file) = &cli.env_file {
        let value = if env_file == "false" {
            Value::Bool(false)
        } else {
            Value::String(env_file.clone())
        };
        root.insert("envFile".into(), value);
    }
    Ok(raw)
}

fn insert_process(
    root: &mut serde_json::Map<String, Value>,
    name: &str,
    command: &str,
) -> Result<()> {
    let processes = root
        .get_mut("processes")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| anyhow!("processes must be a mapping"))?;
    if processes.contains_key(name) {
        bail!("duplicate process name: {name}");
    }
    processes.insert(name.to_string(), Value::String(command.to_string()));
    Ok(())
}

fn dedup_name(root: &serde_json::Map<String, Value>, base: &str) -> String {
    let Some(processes) = root.get("processes").and_then(Value::as_object) else {
        return base.to_string();
    };
    if !processes.contains_key(base) {
        return base.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !processes.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

fn split_names(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn spawn_signal_listener() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(());
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("numux").chain(args.iter().copied()))
    }

    #[test]
    fn name_flags_become_processes() {
        let cli = cli(&["--name", "api=cargo run", "--name", "web=pnpm dev"]);
        let raw = merge_cli_config(None, &cli).unwrap();
        assert_eq!(raw["processes"]["api"], Value::String("cargo run".into()));
        assert_eq!(raw["processes"]["web"], Value::String("pnpm dev".into()));
    }

    #[test]
    fn positional_commands_are_named_by_leading_word() {
        let cli = cli(&["npm run dev", "npm run api"]);
        let raw = merge_cli_config(None, &cli).unwrap();
        assert_eq!(raw["processes"]["npm"], Value::String("npm run dev".into()));
        assert_eq!(
            raw["processes"]["npm-1"],
            Value::String("npm run api".into())
        );
    }

    #[test]
    fn duplicate_name_flags_are_rejected() {
        let cli = cli(&["--name", "api=one", "--name", "api=two"]);
        assert!(merge_cli_config(None, &cli).is_err());
    }

    #[test]
    fn global_flags_override_the_raw_config() {
        let cli = cli(&["--kill-others", "--max-restarts", "2", "--env-file", "false"]);
        let raw = serde_json::json!({"processes": {"api": "serve"}, "envFile": ".env"});
        let merged = merge_cli_config(Some(raw), &cli).unwrap();
        assert_eq!(merged["killOthers"], Value::Bool(true));
        assert_eq!(merged["maxRestarts"], Value::from(2));
        assert_eq!(merged["envFile"], Value::Bool(false));
    }

    #[test]
    fn split_names_handles_commas_and_repeats() {
        let names = split_names(&["a,b".to_string(), " c ".to_string()]);
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
