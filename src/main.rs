//! Annotation Store command line tool
//!
//! Inspection and maintenance of an annotation data directory: file status,
//! graph dumps, deletes, backup recovery and the concurrency stress harness.

use anyhow::{anyhow, Context};
use annotation_store::core::config::{parse_codec, parse_duration, Config};
use annotation_store::storage::AnnotationStorageService;
use annotation_store::system::metrics;
use annotation_store::system::stress::{self, StressConfig};
use annotation_store::types::DocumentKey;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        Config::from_file(config_path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    annotation_store::init(&config)?;
    info!("Data directory {}", config.storage.data_dir.display());

    let service = AnnotationStorageService::from_config(&config)?;

    match matches.subcommand() {
        Some(("stat", args)) => stat(&service, &key_arg(args)?),
        Some(("dump", args)) => dump(&service, &key_arg(args)?),
        Some(("delete", args)) => delete(&service, &key_arg(args)?),
        Some(("recover", _)) => recover(&service),
        Some(("stress", args)) => run_stress(&service, args),
        Some(("metrics", _)) => {
            print!("{}", metrics::collect_metrics());
            Ok(())
        }
        _ => Err(anyhow!("no subcommand given, see --help")),
    }
}

fn cli() -> Command {
    let key = Arg::new("key")
        .value_name("PROJECT/DOCUMENT/OWNER")
        .help("Graph to operate on")
        .required(true);

    Command::new("annotation-store")
        .version(annotation_store::VERSION)
        .about("Inspect and maintain an annotation data directory.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .global(true)
                .help("Data directory path"),
        )
        .arg(
            Arg::new("codec")
                .long("codec")
                .value_name("CODEC")
                .global(true)
                .help("Graph file format (bincode, json, message-pack)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .help("Log format (pretty, json)"),
        )
        .subcommand(
            Command::new("stat")
                .about("Show whether a graph file exists, its version and history")
                .arg(key.clone()),
        )
        .subcommand(
            Command::new("dump")
                .about("Print a graph as JSON")
                .arg(key.clone()),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a graph file")
                .arg(key),
        )
        .subcommand(Command::new("recover").about("Restore or discard backups left by interrupted writes"))
        .subcommand(
            Command::new("stress")
                .about("Run concurrent writers, readers and deleters and verify the result")
                .arg(count_arg("writers", "Exclusive writer threads"))
                .arg(count_arg("readers", "Shared reader threads"))
                .arg(count_arg("observers", "Unmanaged reader threads"))
                .arg(count_arg("deleters", "Deleter threads"))
                .arg(count_arg("documents", "Documents to contend on"))
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .value_name("DURATION")
                        .help("Run time, e.g. 500ms, 10s, 1m"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(Command::new("metrics").about("Print Prometheus metrics"))
}

fn count_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("N")
        .value_parser(clap::value_parser!(u64))
        .help(help)
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.storage.data_dir = data_dir.into();
    }

    if let Some(codec) = matches.get_one::<String>("codec") {
        config.storage.codec = parse_codec(codec)?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }

    Ok(())
}

fn key_arg(args: &ArgMatches) -> anyhow::Result<DocumentKey> {
    let raw = args
        .get_one::<String>("key")
        .ok_or_else(|| anyhow!("missing graph key"))?;
    raw.parse::<DocumentKey>()
        .with_context(|| format!("invalid graph key '{}'", raw))
}

fn stat(service: &AnnotationStorageService, key: &DocumentKey) -> anyhow::Result<()> {
    println!("key:      {}", key);
    println!("path:     {}", service.driver().graph_path(key).display());
    match service.driver().version(key)? {
        Some(version) => println!("version:  {}", version),
        None => println!("version:  (no file)"),
    }
    let history = service.list_history(key)?;
    println!("history:  {} copies", history.len());
    for entry in history {
        println!("  {}", entry.path.display());
    }
    Ok(())
}

fn dump(service: &AnnotationStorageService, key: &DocumentKey) -> anyhow::Result<()> {
    let graph = service
        .inspect(key)
        .with_context(|| format!("cannot load {}", key))?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

fn delete(service: &AnnotationStorageService, key: &DocumentKey) -> anyhow::Result<()> {
    let session = service.open_session(false)?;
    if service.delete(&session, key)? {
        println!("deleted {}", key);
    } else {
        println!("{} did not exist", key);
    }
    Ok(())
}

fn recover(service: &AnnotationStorageService) -> anyhow::Result<()> {
    let report = service.recover()?;
    for path in &report.restored {
        println!("restored  {}", path.display());
    }
    for path in &report.discarded {
        println!("discarded {}", path.display());
    }
    println!("{} restored, {} discarded", report.restored.len(), report.discarded.len());
    Ok(())
}

fn run_stress(service: &AnnotationStorageService, args: &ArgMatches) -> anyhow::Result<()> {
    let mut config = StressConfig::default();
    if let Some(&n) = args.get_one::<u64>("writers") {
        config.writers = n as usize;
    }
    if let Some(&n) = args.get_one::<u64>("readers") {
        config.readers = n as usize;
    }
    if let Some(&n) = args.get_one::<u64>("observers") {
        config.observers = n as usize;
    }
    if let Some(&n) = args.get_one::<u64>("deleters") {
        config.deleters = n as usize;
    }
    if let Some(&n) = args.get_one::<u64>("documents") {
        config.documents = n;
    }
    if let Some(duration) = args.get_one::<String>("duration") {
        config.duration = parse_duration(duration).map_err(|e| anyhow!(e))?;
    }

    let report = stress::run(service, &config)?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} writes ({} rejected), {} reads, {} observed, {} not found, {} deletes in {} ms",
            report.writes,
            report.rejected_writes,
            report.reads,
            report.observed,
            report.not_found,
            report.deletes,
            report.elapsed_ms
        );
        println!("{} graph files decoded after the run", report.final_graphs);
        for failure in &report.failures {
            println!("failure: {}", failure);
        }
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(anyhow!("{} unexpected failures", report.failures.len()))
    }
}
