//! cognit CLI: run production-rule agents from JSON rule files.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};

use cognit_kernel::agent::Agent;
use cognit_kernel::config::AgentConfig;
use cognit_kernel::cycle::{RunOutcome, RunUnit};
use cognit_kernel::persist::SnapshotStore;
use cognit_kernel::production::ast::RuleDef;

#[derive(Parser)]
#[command(name = "cognit", version, about = "Production-rule cognitive kernel")]
struct Cli {
    /// Agent configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of the snapshot store.
    #[arg(long, global = true, default_value = ".cognit")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Unit {
    Decision,
    Phase,
    Elaboration,
    Forever,
}

impl From<Unit> for RunUnit {
    fn from(u: Unit) -> Self {
        match u {
            Unit::Decision => RunUnit::Decision,
            Unit::Phase => RunUnit::Phase,
            Unit::Elaboration => RunUnit::Elaboration,
            Unit::Forever => RunUnit::Forever,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load rules and run an agent.
    Run {
        /// JSON file with an array of rule definitions.
        #[arg(long)]
        rules: PathBuf,

        /// How many units to run.
        #[arg(long, default_value = "10")]
        count: u64,

        #[arg(long, value_enum, default_value = "decision")]
        unit: Unit,

        /// Input elements under the input link, as attr=value.
        #[arg(long = "input")]
        inputs: Vec<String>,

        /// Turn chunking on regardless of the configuration.
        #[arg(long)]
        learning: bool,

        /// Print working memory after the run.
        #[arg(long)]
        dump: bool,
    },

    /// Compile rules and report errors without running.
    Check {
        #[arg(long)]
        rules: PathBuf,
    },

    /// Manage saved agents.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Run an agent and store it under a name.
    Save {
        name: String,
        #[arg(long)]
        rules: PathBuf,
        #[arg(long, default_value = "1")]
        count: u64,
    },
    /// Load a stored agent and continue it.
    Load {
        name: String,
        #[arg(long, default_value = "1")]
        count: u64,
    },
    /// List stored agents.
    List,
    /// Delete a stored agent.
    Delete { name: String },
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(p) => Ok(AgentConfig::load(p)?),
        None => Ok(AgentConfig::default()),
    }
}

fn load_rules(path: &Path) -> Result<Vec<RuleDef>> {
    let content = std::fs::read_to_string(path).into_diagnostic()?;
    serde_json::from_str(&content).into_diagnostic()
}

fn add_inputs(agent: &mut Agent, inputs: &[String]) -> Result<()> {
    let link = agent.input_link();
    for input in inputs {
        let Some((attr, value)) = input.split_once('=') else {
            miette::bail!("input \"{input}\" is not of the form attr=value");
        };
        let attr = agent.symbols_mut().string(attr);
        let value = if let Ok(i) = value.parse::<i64>() {
            agent.symbols_mut().int(i)
        } else if let Ok(x) = value.parse::<f64>() {
            agent.symbols_mut().float(x)
        } else {
            agent.symbols_mut().string(value)
        };
        agent.add_input_wme(link, attr, value)?;
    }
    Ok(())
}

fn report(agent: &mut Agent, outcome: &RunOutcome) {
    let text = agent.take_output_text();
    if !text.is_empty() {
        println!("{text}");
    }
    if let Some(reason) = &outcome.stop {
        println!("{reason}");
    }
    let stats = agent.stats();
    println!(
        "decisions: {}  phases: {}  firings: {}  chunks: {}  wmes: {}",
        stats.decisions,
        stats.phases,
        stats.firings,
        stats.chunks,
        agent.wm().len()
    );
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            rules,
            count,
            unit,
            inputs,
            learning,
            dump,
        } => {
            let config = AgentConfig {
                learning: learning || config.learning,
                ..config
            };
            let mut agent = Agent::new(config);
            agent.add_rules(&load_rules(&rules)?)?;
            add_inputs(&mut agent, &inputs)?;
            let outcome = agent.run_for(count, unit.into())?;
            report(&mut agent, &outcome);
            if dump {
                for line in agent.render_wmes() {
                    println!("{line}");
                }
            }
        }

        Commands::Check { rules } => {
            let defs = load_rules(&rules)?;
            let mut agent = Agent::new(config);
            let mut failed = 0;
            for def in &defs {
                if let Err(e) = agent.add_rule(def) {
                    eprintln!("{:?}", miette::Report::new(e));
                    failed += 1;
                }
            }
            let stats = agent.network_stats();
            println!(
                "{} rule(s) compiled, {} rejected; {} alpha memories, {} join nodes",
                defs.len() - failed,
                failed,
                stats.alpha_memories,
                stats.join_nodes()
            );
            if failed > 0 {
                miette::bail!("{failed} rule(s) failed to compile");
            }
        }

        Commands::Snapshot { action } => {
            let store = SnapshotStore::open(&cli.store)?;
            match action {
                SnapshotAction::Save { name, rules, count } => {
                    let mut agent = Agent::new(config);
                    agent.add_rules(&load_rules(&rules)?)?;
                    let outcome = agent.run_for(count, RunUnit::Decision)?;
                    report(&mut agent, &outcome);
                    store.save(&name, &agent)?;
                    println!("Saved \"{name}\" to {}", cli.store.display());
                }
                SnapshotAction::Load { name, count } => {
                    let mut agent = Agent::new(config);
                    store.load(&name, &mut agent)?;
                    let outcome = agent.run_for(count, RunUnit::Decision)?;
                    report(&mut agent, &outcome);
                }
                SnapshotAction::List => {
                    let names = store.names()?;
                    if names.is_empty() {
                        println!("No snapshots in {}", cli.store.display());
                    }
                    for name in names {
                        println!("{name}");
                    }
                }
                SnapshotAction::Delete { name } => {
                    if store.delete(&name)? {
                        println!("Deleted \"{name}\"");
                    } else {
                        println!("No snapshot named \"{name}\"");
                    }
                }
            }
        }
    }

    Ok(())
}
