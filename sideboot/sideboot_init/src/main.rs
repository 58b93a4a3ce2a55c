use std::fs;
use std::path::PathBuf;

use clap::Parser;
use sideboot_boot::options::DEBUG;
use sideboot_boot::BootOptions;
use tracing::{debug, warn};

mod logging;
mod settings;
mod shell;
mod supervisor;

use settings::Settings;
use supervisor::Supervisor;

/// Marks descendants and re-executions as not the first process
const FIRST_PROCESS_ENV: &str = "SIDEBOOT";

/// Sideboot boot orchestrator
///
/// Mounts the boot partition named on the kernel commandline, follows its
/// config and chainloads the kernel it names. Falls back to a shell.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about)]
struct Cli {
    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,

    /// Settings file (TOML)
    #[clap(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Boot option overrides such as --sideboot.kernel=/vmlinuz
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() {
    let (cli, cli_error) = match Cli::try_parse() {
        Ok(cli) => (cli, None),
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let cli = Cli {
                overrides: std::env::args().skip(1).collect(),
                ..Cli::default()
            };
            (cli, Some(err))
        }
    };

    let first_process = std::env::var(FIRST_PROCESS_ENV).map_or(true, |value| value != "1");
    std::env::set_var(FIRST_PROCESS_ENV, "1");

    let (settings, loaded) = match Settings::load(cli.settings.as_deref()) {
        Ok((settings, source)) => (settings, Ok(source)),
        Err(err) => (Settings::default(), Err(err)),
    };

    let cmdline = if first_process {
        fs::read_to_string(&settings.cmdline_path).unwrap_or_default()
    } else {
        String::new()
    };
    let mut options = BootOptions::with_defaults();
    let failures = options.merge(cmdline.trim_end(), "", &cli.overrides);

    // Settings and the commandline decide the level, so their reports wait
    logging::init(cli.verbose || options.get(DEBUG) == "1");

    if let Some(err) = cli_error {
        warn!("treating all arguments as overrides: {}", err.to_string().trim_end());
    }
    match loaded {
        Ok(source) => source.log(),
        Err(err) => warn!("{:#}, using defaults", err),
    }
    for failure in &failures {
        warn!(%failure, "ignoring option source");
    }
    debug!(first_process, options = ?options, "starting");

    let code = Supervisor::new(settings, first_process, cli.overrides)
        .run(options)
        .await;

    // Exit without dropping the runtime, which would wait on the stdin reader.
    std::process::exit(code);
}
