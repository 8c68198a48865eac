use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use libchannel_engine::channel::SourceKind;
use libchannel_engine::config::EngineConfig;
use libchannel_engine::engine::ChannelEngine;
use libchannel_engine::error::EngineError;

const DEFAULT_MAX_POINTS: &str = "1000";

fn make_template_config(path: &Path) -> Result<(), String> {
    let config = EngineConfig::default();
    let yaml_str = serde_yaml::to_string(&config).map_err(|e| e.to_string())?;
    let mut file = File::create(path).map_err(|e| format!("Could not create {path:?}: {e}"))?;
    file.write_all(yaml_str.as_bytes())
        .map_err(|e| format!("Failed to write yaml data to file: {e}"))
}

fn print_yaml<T: Serialize>(value: &T) {
    match serde_yaml::to_string(value) {
        Ok(yaml_str) => println!("{yaml_str}"),
        Err(e) => log::error!("Could not format output: {e}"),
    }
}

fn experiment_arg() -> Arg {
    Arg::new("experiment")
        .short('e')
        .long("experiment")
        .required(true)
        .help("Experiment id (directory name under data_path)")
}

fn source_arg() -> Arg {
    Arg::new("source")
        .short('s')
        .long("source")
        .required(true)
        .help("Source kind: scope, temperature, acceleration, position or chunked")
}

fn parse_source(matches: &ArgMatches) -> Result<SourceKind, String> {
    let name = matches
        .get_one::<String>("source")
        .ok_or_else(|| String::from("A source is required"))?;
    SourceKind::from_str(name).map_err(|e| e.to_string())
}

fn parse_f64(matches: &ArgMatches, name: &str) -> Result<f64, String> {
    match matches.get_one::<String>(name) {
        Some(value) => value
            .parse::<f64>()
            .map_err(|e| format!("Bad value for --{name}: {e}")),
        None => Ok(f64::NAN),
    }
}

async fn run(engine: &ChannelEngine, command: &str, matches: &ArgMatches) -> Result<(), String> {
    let experiment = matches
        .get_one::<String>("experiment")
        .ok_or_else(|| String::from("An experiment is required"))?;
    let to_string = |e: EngineError| e.to_string();

    match command {
        "channels" => {
            let source = parse_source(matches)?;
            print_yaml(&engine.list_channels(experiment, source).await.map_err(to_string)?);
        }
        "window" => {
            let start = parse_f64(matches, "start")?;
            let end = parse_f64(matches, "end")?;
            let max_points = matches
                .get_one::<String>("points")
                .map(|p| p.parse::<usize>())
                .transpose()
                .map_err(|e| format!("Bad value for --points: {e}"))?
                .unwrap_or(1000);
            if matches.get_flag("magnitude") {
                let window = engine
                    .magnitude_window(experiment, start, end, max_points)
                    .await
                    .map_err(to_string)?;
                print_yaml(&window);
                return Ok(());
            }
            let source = parse_source(matches)?;
            let ids: Vec<&str> = matches
                .get_many::<String>("channel")
                .map(|ids| ids.map(|id| id.as_str()).collect())
                .unwrap_or_default();
            let windows = if matches.get_flag("aligned") {
                engine
                    .bulk_aligned_channel_window(experiment, source, &ids, start, end, max_points)
                    .await
            } else {
                engine
                    .bulk_channel_window(experiment, source, &ids, start, end, max_points)
                    .await
            }
            .map_err(to_string)?;
            for (id, window) in windows {
                match window {
                    Ok(window) => print_yaml(&std::collections::BTreeMap::from([(id, window)])),
                    Err(e) => log::error!("{e}"),
                }
            }
        }
        "stats" => {
            let source = parse_source(matches)?;
            let id = matches
                .get_one::<String>("channel")
                .ok_or_else(|| String::from("A channel is required"))?;
            print_yaml(&engine.statistics(experiment, source, id).await.map_err(to_string)?);
        }
        "align" => {
            if let Some(offset) = matches.get_one::<String>("offset") {
                let source = parse_source(matches)?;
                let offset = match offset.as_str() {
                    "none" => None,
                    value => Some(
                        value
                            .parse::<f64>()
                            .map_err(|e| format!("Bad value for --offset: {e}"))?,
                    ),
                };
                let record = engine
                    .set_manual_offset(experiment, source, offset)
                    .await
                    .map_err(to_string)?;
                print_yaml(&record);
            } else {
                let record = engine
                    .align_experiment(experiment, matches.get_flag("force"))
                    .await
                    .map_err(to_string)?;
                print_yaml(&record);
            }
        }
        _ => return Err(format!("Unknown command {command}")),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Create a cli
    let matches = Command::new("channel_engine_cli")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("channels")
                .about("List the channels of a source")
                .arg(experiment_arg())
                .arg(source_arg()),
        )
        .subcommand(
            Command::new("window")
                .about("Print a window of one or more channels reduced to a point budget")
                .arg(experiment_arg())
                .arg(source_arg().required(false))
                .arg(
                    Arg::new("channel")
                        .short('c')
                        .long("channel")
                        .action(ArgAction::Append)
                        .help("Channel id, may be repeated"),
                )
                .arg(Arg::new("start").long("start").allow_negative_numbers(true))
                .arg(Arg::new("end").long("end").allow_negative_numbers(true))
                .arg(
                    Arg::new("points")
                        .short('n')
                        .long("points")
                        .default_value(DEFAULT_MAX_POINTS),
                )
                .arg(
                    Arg::new("aligned")
                        .long("aligned")
                        .action(ArgAction::SetTrue)
                        .help("Interpret start/end on the master timeline"),
                )
                .arg(
                    Arg::new("magnitude")
                        .long("magnitude")
                        .action(ArgAction::SetTrue)
                        .help("Combined magnitude of the acceleration axes"),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Print summary statistics of a channel")
                .arg(experiment_arg())
                .arg(source_arg())
                .arg(Arg::new("channel").short('c').long("channel").required(true)),
        )
        .subcommand(
            Command::new("align")
                .about("Compute or override the alignment of an experiment")
                .arg(experiment_arg())
                .arg(source_arg().required(false))
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Recompute even if an alignment is stored"),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .allow_negative_numbers(true)
                        .requires("source")
                        .help("Manual offset in seconds for --source, or none to clear it"),
                ),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required (-p/--path)");
        return;
    };

    let (command, sub_matches) = match matches.subcommand() {
        Some(("new", _)) => {
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            match make_template_config(&config_path) {
                Ok(()) => log::info!("Done."),
                Err(e) => log::error!("{e}"),
            }
            return;
        }
        Some((command, sub_matches)) => (command, sub_matches),
        None => {
            log::error!("No command given");
            return;
        }
    };

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match EngineConfig::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Data Path: {}", config.data_path.to_string_lossy());
    log::info!(
        "Cache TTL: {} s Capacity: {}",
        config.cache_ttl_secs,
        config.cache_capacity
    );
    if !config.is_cache_capacity_valid() {
        log::error!("Cache capacity must be at least 1");
        return;
    }

    let engine = ChannelEngine::from_config(config);

    // Setup the spinner
    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.set_message(format!("Running {command}..."));
    pb.enable_steady_tick(Duration::from_millis(100));

    let result = run(&engine, command, sub_matches).await;
    pb.finish_and_clear();

    match result {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("{command} failed with error: {e}"),
    }
}
