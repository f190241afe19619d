use clap::{CommandFactory, FromArgMatches, Parser};
use dsonnet::{commands::Commands, externals};
use log::{error, LevelFilter};
use std::process::ExitCode;

/// Evaluate Jsonnet configuration with external variables, glob imports
/// and pluggable data sources.
#[derive(Debug, Parser)]
#[clap(bin_name = "dsonnet", author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Args available to all subcommands
#[derive(Debug, Parser)]
pub struct GlobalArgs {
    /// Increase output verbosity, for debugging. Supports up to -vvv
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    // The externals flag family is attached with the builder API: the
    // shorthand aliases are gated on a runtime parameter, which derive
    // can't express
    let command = Args::command()
        .mut_subcommand("eval", |sub| externals::augment_command(sub, true));
    let matches = command.get_matches();
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(error) => error.exit(),
    };

    env_logger::Builder::new()
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .filter_level(match args.global.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            3.. => LevelFilter::Trace,
        })
        .init();
    let verbose = args.global.verbose > 0;

    match args.command.execute(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Most of the time this is a user error, but this will also
            // handle system errors or application bugs. The user should
            // pass -v to get a stack trace for debugging.
            // https://docs.rs/anyhow/1.0.71/anyhow/struct.Error.html#display-representations
            if verbose {
                error!("{error:#}\n{}", error.backtrace());
            } else {
                error!("{error:#}");
            }
            ExitCode::FAILURE
        }
    }
}
