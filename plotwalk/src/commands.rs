use crate::CLAP_STYLING;
use clap::{arg, command};
use std::path::PathBuf;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("plotwalk")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("plotwalk")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(arg!(-v --"verbose" "Debug-level logging").required(false).global(true))
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Sweep configuration file")
                .default_value("~/.config/plotwalk/sweep.json"),
        )
        .arg(
            arg!(-d --"database" <PATH>)
                .required(false)
                .global(true)
                .help("Listing database")
                .default_value("~/.config/plotwalk/plotwalk.db"),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a starter configuration and creates the listing database")
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing configuration and database")
                        .required(false),
                ),
        )
        .subcommand(
            command!("sweep")
                .about("Sweeps every configured region, resuming from the last checkpoint")
                .arg(
                    arg!(-r --"region" <CODE>)
                        .required(false)
                        .help("Only sweep these region codes (repeatable)")
                        .action(clap::ArgAction::Append),
                )
                .arg(
                    arg!(--"max-passes" <N>)
                        .required(false)
                        .help("Stop after this many global passes")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    arg!(--"quota" <RECORDS>)
                        .required(false)
                        .help("Pause once this many records have been ingested")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(--"headed")
                        .required(false)
                        .help("Show the browser window")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"webdriver" <URL>)
                        .required(false)
                        .help("WebDriver endpoint (default: from config)"),
                ),
        )
        .subcommand(
            command!("status")
                .about("Shows the checkpoint, quota and recent runs")
                .arg(arg!(--"json" "Machine-readable output").required(false)),
        )
        .subcommand(
            command!("listings")
                .about("Lists harvested listings")
                .arg(arg!(-r --"region" <CODE>).required(false).help("Only this region"))
                .arg(
                    arg!(-n --"limit" <N>)
                        .required(false)
                        .help("Maximum rows to print")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("50"),
                )
                .arg(arg!(--"json" "Machine-readable output").required(false)),
        )
        .subcommand(
            command!("reset")
                .about("Clears sweep progress so the next run starts from the beginning")
                .arg(
                    arg!(--"quota")
                        .required(false)
                        .help("Also reset the ingestion quota counter")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("export-config")
                .about("Prints the effective configuration with all defaults filled in")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Write to a file instead of stdout")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definition_is_valid() {
        command_argument_builder().debug_assert();
    }

    #[test]
    fn test_sweep_regions_repeat() {
        let matches = command_argument_builder()
            .try_get_matches_from(["plotwalk", "sweep", "-r", "NY", "--region", "NJ"])
            .unwrap();
        let (_, sweep) = matches.subcommand().unwrap();
        let regions: Vec<&String> = sweep.get_many::<String>("region").unwrap().collect();
        assert_eq!(regions, vec!["NY", "NJ"]);
    }

    #[test]
    fn test_global_paths_have_defaults() {
        let matches = command_argument_builder()
            .try_get_matches_from(["plotwalk", "status"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("database").map(String::as_str),
            Some("~/.config/plotwalk/plotwalk.db")
        );
    }
}
