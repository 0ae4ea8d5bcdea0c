//! tbm - command line front end for the testbed monitor
//!
//! Connects to the site manager, waits for pings to settle, then runs one
//! command over the selected nodes and prints one result per node.
//!
//! # Usage
//!
//! ```text
//! tbm -r nodes.txt status                      # liveness of every node
//! tbm -r nodes.txt --type telosb --online tail -n 20
//! tbm -r nodes.txt --gid 'n0*' send ping --expect pong --tries 3
//! tbm -r nodes.txt program blink.ihex --sequential
//! tbm -r nodes.txt log testbed.log --append    # until Ctrl-C
//! ```

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tbm_monitor::{
    FanOut, MonitorConfig, Node, NodeActions, NodeCollection, NodeCommand, NodeOperation,
    NodeStatus, Program, Reset, Selector, Session, TelosbActions,
};

// ============================================================================
// CLI Arguments
// ============================================================================

/// tbm - monitor and control testbed nodes through the site manager
#[derive(Parser, Debug)]
#[command(name = "tbm")]
#[command(about = "Monitor and control testbed nodes through the site manager")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Node roster (`gid type tos_id rime_addr` per line)
    #[arg(long, short = 'r')]
    roster: PathBuf,

    /// Configuration file (default: $TBM_CONFIG, then the user config dir)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Site manager host, overriding configuration and $TBM_GATEWAY
    #[arg(long, global = true)]
    gateway: Option<String>,

    /// Only nodes whose gid matches this wildcard
    #[arg(long, global = true)]
    gid: Option<String>,

    /// Only nodes whose type matches this wildcard
    #[arg(long = "type", global = true)]
    node_type: Option<String>,

    /// Extra `name=pattern` criteria, e.g. `host=node1*`
    #[arg(long, short = 's', global = true)]
    select: Vec<String>,

    /// Only nodes that are online after settling
    #[arg(long, global = true)]
    online: bool,

    /// Seconds to wait for pings after connecting
    #[arg(long, default_value_t = 2.0, global = true)]
    settle: f64,

    /// Maximum nodes handled at once (0 = all)
    #[arg(long, short = 'j', default_value_t = 0, global = true)]
    jobs: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show liveness and application state
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the most recent log lines
    Tail {
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
        /// Lines as received, without rendering
        #[arg(long)]
        raw: bool,
    },
    /// Send a message to the application
    Send {
        message: String,
        /// Wait for output matching this regex
        #[arg(long)]
        expect: Option<String>,
        /// Seconds to wait per try
        #[arg(long, default_value_t = 1.0)]
        timeout: f64,
        #[arg(long, default_value_t = 1)]
        tries: u32,
        /// Repeat period requested from the site manager (0 = once)
        #[arg(long, default_value_t = 0)]
        period: u32,
    },
    /// Update the reported position
    Position { position: String },
    /// Start the application
    StartApp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop the application
    StopApp,
    /// Flash an image (TelosB)
    Program {
        image: PathBuf,
        /// One node at a time
        #[arg(long)]
        sequential: bool,
        /// Show scp/ssh output
        #[arg(long)]
        verbose: bool,
    },
    /// Reset nodes (TelosB)
    Reset,
    /// Write every log line to a file until interrupted
    Log {
        file: PathBuf,
        #[arg(long)]
        append: bool,
    },
}

// ============================================================================
// Setup
// ============================================================================

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tbm=info".parse()?)
                .add_directive("tbm_monitor=info".parse()?),
        )
        .init();
    Ok(())
}

fn load_config(args: &Args) -> Result<MonitorConfig> {
    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MonitorConfig::load_default().context("failed to load config")?,
    };
    let mut config = config.with_env_overrides();
    if let Some(host) = &args.gateway {
        config.gateway.host = host.clone();
    }
    Ok(config)
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what}: {value}"))
}

fn select_nodes(session: &Session, args: &Args) -> Result<NodeCollection> {
    let mut selector = Selector::new();
    if let Some(gid) = &args.gid {
        selector = selector.glob("gid", gid)?;
    }
    if let Some(node_type) = &args.node_type {
        selector = selector.glob("type", node_type)?;
    }
    for criterion in &args.select {
        selector = selector.with_criterion(criterion)?;
    }

    let mut nodes = session.nodes().select(&selector);
    if args.online {
        nodes = nodes.filter(Node::is_online);
    }
    if nodes.is_empty() {
        warn!(selector = %selector, online = args.online, "No nodes selected");
    } else {
        debug!(count = nodes.len(), selector = %selector, "Selected nodes");
    }
    Ok(nodes)
}

// ============================================================================
// Commands
// ============================================================================

async fn fan_out<O>(nodes: &NodeCollection, op: O, jobs: usize) -> FanOut<O::Output>
where
    O: NodeOperation + 'static,
    O::Output: 'static,
{
    if jobs == 0 {
        nodes.run_parallel(op).await
    } else {
        nodes.run_parallel_bounded(op, jobs).await
    }
}

/// Prints one line per node; fails if any node failed.
fn report<T: Display>(results: &FanOut<T>) -> Result<()> {
    for (node, result) in results.iter() {
        match result {
            Ok(value) => println!("{node}: {value}"),
            Err(e) => println!("{node}: error: {e}"),
        }
    }
    let failed = results.failed().count();
    if failed > 0 {
        bail!("{failed} of {} nodes failed", results.len());
    }
    Ok(())
}

fn print_status(statuses: &[NodeStatus], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses)?);
        return Ok(());
    }
    for status in statuses {
        let seen = status
            .last_seen_ms
            .map(|ms| format!("{ms}ms ago"))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<28} {:<8} {:<8} app={:<8} seen {seen}",
            status.display,
            status.type_name,
            status.liveness.to_string(),
            status.app_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run(session: &Session, args: &Args) -> Result<()> {
    if let Command::Log { file, append } = &args.command {
        session
            .log_to_file(file, *append)
            .with_context(|| format!("failed to open {}", file.display()))?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
        info!("Interrupted, stopping");
        return Ok(());
    }

    let settle = seconds(args.settle, "settle time")?;
    debug!(?settle, "Waiting for pings");
    sleep(settle).await;

    let nodes = select_nodes(session, args)?;
    let jobs = args.jobs;

    match &args.command {
        Command::Status { json } => {
            let statuses: Vec<NodeStatus> = nodes.iter().map(Node::status).collect();
            print_status(&statuses, *json)
        }
        Command::Tail { lines, raw } => {
            let results = fan_out(
                &nodes,
                NodeCommand::Tail {
                    lines: *lines,
                    raw: *raw,
                },
                jobs,
            )
            .await;
            for (node, result) in results.iter() {
                match result {
                    Ok(outcome) if *raw => println!("== {node} ==\n{outcome}"),
                    Ok(outcome) => println!("{outcome}"),
                    Err(e) => println!("{node}: error: {e}"),
                }
            }
            Ok(())
        }
        Command::Send {
            message,
            expect,
            timeout,
            tries,
            period,
        } => {
            let command = match expect {
                Some(pattern) => NodeCommand::SendToAppAndExpect {
                    message: message.clone(),
                    pattern: pattern.clone(),
                    timeout: seconds(*timeout, "timeout")?,
                    tries: *tries,
                },
                None => NodeCommand::SendToApp {
                    message: message.clone(),
                    period: *period,
                },
            };
            report(&fan_out(&nodes, command, jobs).await)
        }
        Command::Position { position } => {
            report(&fan_out(&nodes, NodeCommand::SetPosition(position.clone()), jobs).await)
        }
        Command::StartApp { args: app_args } => {
            report(&fan_out(&nodes, NodeCommand::StartApp(app_args.clone()), jobs).await)
        }
        Command::StopApp => report(&fan_out(&nodes, NodeCommand::StopApp, jobs).await),
        Command::Program {
            image,
            sequential,
            verbose,
        } => {
            let actions: Arc<dyn NodeActions> = Arc::new(TelosbActions::new().verbose(*verbose));
            let op = Program::new(actions, image.clone());
            if *sequential {
                report(&nodes.run_sequential(&op).await)
            } else {
                report(&fan_out(&nodes, op, jobs).await)
            }
        }
        Command::Reset => {
            let actions: Arc<dyn NodeActions> = Arc::new(TelosbActions::new());
            report(&fan_out(&nodes, Reset::new(actions), jobs).await)
        }
        Command::Log { .. } => Ok(()),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let config = load_config(&args)?;
    let session = Session::from_roster_file(config, &args.roster)
        .with_context(|| format!("failed to load roster {}", args.roster.display()))?;
    session
        .connect()
        .await
        .context("failed to connect to site manager")?;

    let outcome = run(&session, &args).await;
    session.shutdown().await;
    outcome
}
