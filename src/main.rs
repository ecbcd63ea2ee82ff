use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use paintcore::cli::{self, CliArgs};
use paintcore::logger;
use paintcore::settings::EngineSettings;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let settings = EngineSettings::load();

    // Initialize session log (overwrites previous session log)
    let level = if args.verbose { LevelFilter::Debug } else { settings.log_level };
    logger::init(level, args.verbose);

    cli::run(args, &settings)
}
