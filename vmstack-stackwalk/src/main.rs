// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::boxed::Box;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::panic;
use std::path::Path;
use std::str::FromStr;

use vmstack::MemorySnapshot;
use vmstack_common::format::VmLayout;
use vmstack_repo::RepoStore;
use vmstack_unwind::{walk_thread, CallStack, WalkMode, WalkOptions};

use clap::{AppSettings, Arg, Command};
use log::{error, info};
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

fn make_app() -> Command<'static> {
    Command::new("vmstack-stackwalk")
        .version(clap::crate_version!())
        .about("Prints the backtraces of a virtual-machine process snapshot.")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(Arg::new("json").long("json").long_help(
            "Emit machine-readable JSON, one document per thread.

Each document holds the thread's frames and how the walk ended.",
        ))
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .help("Pretty-print --json output."),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(&["interpreted", "mixed"])
                .default_value("interpreted")
                .long_help(
                    "Which frames to walk.

interpreted: follow the interpreted frame chain from each thread's leaf frame.
mixed: walk the native frames recorded in the snapshot, showing frames that \
execute jitted code as the interpreted frames they belong to.",
                ),
        )
        .arg(
            Arg::new("thread")
                .long("thread")
                .takes_value(true)
                .help("Only walk the thread with this index (all threads by default)"),
        )
        .arg(
            Arg::new("max-frames")
                .long("max-frames")
                .takes_value(true)
                .default_value("4096")
                .help("The most frames to produce for a single thread"),
        )
        .arg(
            Arg::new("repo")
                .long("repo")
                .multiple_occurrences(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "A repository database, as ID=PATH.

Line tables of units loaded from repository ID are read from the database at PATH. \
May be given once per repository.",
                ),
        )
        .arg(
            Arg::new("repo-schema")
                .long("repo-schema")
                .takes_value(true)
                .help("Suffix of the line table names in the repositories"),
        )
        .arg(
            Arg::new("layout")
                .long("layout")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "A JSON file describing the layout of the target's runtime structures.

Fields the file leaves out keep the layout of the reference build.",
                ),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .long_help(
                    "Set the logging level.

The walker is instrumented with `trace` logging, so --verbose=trace shows every frame \
as it is built.",
                ),
        )
        .arg(
            Arg::new("snapshot")
                .required(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to the snapshot file to walk."),
        )
}

/// Parse a `--repo` value of the form `ID=PATH`.
fn parse_repo(value: &str) -> Option<(i8, &Path)> {
    let (id, path) = value.split_once('=')?;
    let id = i8::from_str(id.trim()).ok()?;
    if path.is_empty() {
        return None;
    }
    Some((id, Path::new(path)))
}

fn fail(message: std::fmt::Arguments) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

#[cfg_attr(test, allow(dead_code))]
fn main() {
    let matches = make_app().get_matches();

    let output_file = matches
        .value_of_os("output-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let log_file = matches
        .value_of_os("log-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let verbosity = match matches.value_of("verbose") {
        Some("off") => LevelFilter::Off,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Init the logger (and make trace logging less noisy)
    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_level_color(Level::Trace, None)
        .build();
    if let Some(log_path) = log_file {
        match File::create(&log_path) {
            Ok(log_file) => {
                let _ = WriteLogger::init(verbosity, config, log_file);
            }
            Err(e) => {
                eprintln!("couldn't create log file {}: {}", log_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        let _ = TermLogger::init(verbosity, config, TerminalMode::Stderr, ColorChoice::Auto);
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    let layout = match matches.value_of_os("layout").map(Path::new) {
        Some(path) => match VmLayout::from_json_path(path) {
            Ok(layout) => layout,
            Err(err) => fail(format_args!(
                "{} - Error reading layout {}: {}",
                err.name(),
                path.display(),
                err
            )),
        },
        None => VmLayout::default(),
    };

    let max_frames = matches
        .value_of("max-frames")
        .map(usize::from_str)
        .unwrap_or(Ok(WalkOptions::default().max_frames));
    let options = match max_frames {
        Ok(max_frames) => WalkOptions::default().max_frames(max_frames),
        Err(e) => fail(format_args!("Invalid --max-frames: {}", e)),
    };

    let mode = match matches.value_of("mode") {
        Some("mixed") => WalkMode::Mixed,
        _ => WalkMode::Interpreted,
    };

    let mut store = RepoStore::new();
    if let Some(repos) = matches.values_of_os("repo") {
        for repo in repos {
            let repo = repo.to_string_lossy();
            match parse_repo(&repo) {
                Some((id, path)) => store.add_repo(id, path),
                None => fail(format_args!("Invalid --repo {}, expected ID=PATH", repo)),
            }
        }
    }
    if let Some(schema) = matches.value_of("repo-schema") {
        if let Err(err) = store.set_schema(schema) {
            fail(format_args!("{} - {}", err.name(), err));
        }
    }

    let json = matches.is_present("json");
    let pretty = matches.is_present("pretty");
    if pretty && !json {
        fail(format_args!("The --pretty flag is only valid with --json"));
    }

    let thread_index = match matches.value_of("thread").map(usize::from_str) {
        Some(Ok(index)) => Some(index),
        Some(Err(e)) => fail(format_args!("Invalid --thread: {}", e)),
        None => None,
    };

    let snapshot_path = match matches.value_of_os("snapshot") {
        Some(path) => Path::new(path),
        None => fail(format_args!("No snapshot given")),
    };

    let snapshot = match MemorySnapshot::read_path(snapshot_path) {
        Ok(snapshot) => snapshot,
        Err(err) => fail(format_args!("{} - Error reading snapshot: {}", err.name(), err)),
    };
    vmstack::lint(&snapshot);

    let threads: Vec<usize> = match thread_index {
        Some(index) if index < snapshot.threads().len() => vec![index],
        Some(index) => fail(format_args!(
            "No thread {} (the snapshot has {})",
            index,
            snapshot.threads().len()
        )),
        None => (0..snapshot.threads().len()).collect(),
    };

    let stacks: Vec<CallStack> = threads
        .into_iter()
        .filter_map(|index| snapshot.thread(index))
        .map(|thread| walk_thread(&thread, &layout, &store, &options, mode))
        .collect();
    info!("walked {} threads", stacks.len());

    let mut stdout;
    let mut output_f;
    let mut output: &mut dyn Write = if let Some(output_path) = output_file {
        output_f = match File::create(&output_path) {
            Ok(f) => f,
            Err(e) => fail(format_args!(
                "Couldn't create {}: {}",
                output_path.display(),
                e
            )),
        };
        &mut output_f
    } else {
        stdout = std::io::stdout();
        &mut stdout
    };

    if let Err(e) = print_stacks(&stacks, &mut output, json, pretty) {
        fail(format_args!("Error writing output: {}", e));
    }
}

fn print_stacks<T: Write>(
    stacks: &[CallStack],
    output: &mut T,
    json: bool,
    pretty: bool,
) -> std::io::Result<()> {
    for (i, stack) in stacks.iter().enumerate() {
        if json {
            stack.print_json(output, pretty)?;
        } else {
            if i > 0 {
                writeln!(output)?;
            }
            stack.print(output)?;
        }
    }
    output.flush()
}
