//! Encore CLI - Command-line interface for the Encore engine
//!
//! Provides subcommands for initializing storage, running and resuming
//! routines, supplying suspended call results and inspecting session stacks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use encore::interpreter::{CacheKeying, CallArgs, CallKey, Value};
use encore::runtime::dispatcher::{DeferringHost, Dispatcher, RunOutcome};
use encore::runtime::registry::RoutineRegistry;
use encore::runtime::storage::{self, FileStore};
use encore::runtime::{Engine, EngineConfig, SessionId};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Durable, resumable routine execution engine", long_about = None)]
struct Cli {
    /// Root directory for engine storage
    #[arg(short, long, default_value = ".encore")]
    root: PathBuf,

    /// Routine manifest (JSON)
    #[arg(short, long, default_value = "routines.json")]
    manifest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize engine storage
    Init {
        /// Key calls by call-site position instead of argument content
        #[arg(long)]
        positional_keys: bool,

        /// Maximum frames on one session stack
        #[arg(long, default_value = "16")]
        max_nesting_depth: usize,

        /// Longest list the `range` builtin may produce
        #[arg(long, default_value = "100000")]
        max_range_len: usize,

        /// Enable debug tracing for every later command
        #[arg(long)]
        debug: bool,
    },

    /// Run a routine (resumes if the same invocation is already suspended)
    Run {
        /// Routine designation (skill.routine)
        designation: String,

        /// Session ID
        #[arg(short, long)]
        session: String,

        /// Positional argument (JSON, repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Keyword argument as name=JSON (repeatable)
        #[arg(long = "kw")]
        keywords: Vec<String>,
    },

    /// Supply the result of a suspended call
    Provide {
        /// Session ID
        #[arg(short, long)]
        session: String,

        /// Call identity reported by the suspension
        #[arg(short, long)]
        key: String,

        /// Result value (JSON)
        #[arg(long)]
        value: String,
    },

    /// Resume the top frame of a session
    Resume {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },

    /// Show the frames of a session
    Stack {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },

    /// Discard all frames of a session
    Abort {
        /// Session ID
        #[arg(short, long)]
        session: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing at the level the engine configuration asks for
    let level = match &cli.command {
        Commands::Init { debug, .. } => EngineConfig {
            debug: *debug,
            ..EngineConfig::default()
        }
        .tracing_level(),
        _ => storage::load_config(&cli.root)
            .map(|config| config.tracing_level())
            .unwrap_or(tracing::Level::INFO),
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Init {
            positional_keys,
            max_nesting_depth,
            max_range_len,
            debug,
        } => {
            let root = cli.root.clone();
            let config = EngineConfig {
                root: cli.root,
                keying: if positional_keys {
                    CacheKeying::Position
                } else {
                    CacheKeying::Content
                },
                max_nesting_depth,
                max_range_len,
                debug,
                ..EngineConfig::default()
            };

            Engine::init(config)?;
            println!("Initialized Encore engine at {:?}", root);
        }

        Commands::Run {
            designation,
            session,
            args,
            keywords,
        } => {
            let mut call_args = CallArgs::positional(args.iter().map(|arg| parse_value(arg)));
            for keyword in &keywords {
                let (name, value) = keyword
                    .split_once('=')
                    .with_context(|| format!("keyword argument '{}' is not name=value", keyword))?;
                call_args = call_args.with_keyword(name, parse_value(value));
            }

            let mut dispatcher = open(&cli.root, &cli.manifest)?;
            let outcome = dispatcher.run(&SessionId::new(session), &designation, call_args)?;
            print_outcome(&outcome)?;
        }

        Commands::Provide {
            session,
            key,
            value,
        } => {
            let mut dispatcher = open(&cli.root, &cli.manifest)?;
            dispatcher.provide(&SessionId::new(session), &CallKey::new(key), parse_value(&value))?;
            println!("Result recorded");
        }

        Commands::Resume { session } => {
            let mut dispatcher = open(&cli.root, &cli.manifest)?;
            let outcome = dispatcher.resume(&SessionId::new(session))?;
            print_outcome(&outcome)?;
        }

        Commands::Stack { session } => {
            let dispatcher = open(&cli.root, &cli.manifest)?;
            let frames = dispatcher.stack(&SessionId::new(session)).frames()?;

            println!("Frames (bottom to top):");
            for frame in frames {
                println!(
                    "  {}  {}{}  created {}",
                    frame.id,
                    frame.routine,
                    frame.args,
                    frame.created_at.to_rfc3339()
                );
            }
        }

        Commands::Abort { session } => {
            let mut dispatcher = open(&cli.root, &cli.manifest)?;
            let removed = dispatcher.abort(&SessionId::new(session))?;
            println!("Removed {} frames", removed);
        }
    }

    Ok(())
}

fn open(root: &Path, manifest: &Path) -> Result<Dispatcher<FileStore, DeferringHost>> {
    let engine = Engine::load(root.to_path_buf())?;
    let registry = RoutineRegistry::load_manifest(manifest)?;
    Ok(engine.dispatcher(registry, DeferringHost))
}

/// JSON when it parses, otherwise the raw text as a string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed(value) => {
            println!("Completed: {}", serde_json::to_string_pretty(&value.to_json())?);
        }
        RunOutcome::Suspended(paused) => {
            println!("Suspended: {}", serde_json::to_string_pretty(paused)?);
        }
    }
    Ok(())
}
