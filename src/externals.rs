//! Ingestion of user-supplied inputs: external/top-level variables from
//! flags, the environment, files and list files, plus library paths and
//! data source URLs. Everything here runs before the first evaluation and
//! any error is fatal, so no partial [Externals] ever escapes.

use anyhow::{anyhow, bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indexmap::IndexMap;
use log::debug;
use std::{env, fs, path::PathBuf};

/// A raw user-supplied value. `is_code` distinguishes Jsonnet snippets from
/// plain strings; snippets are *not* validated here, the runtime evaluates
/// them lazily on first reference.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserVal {
    pub value: String,
    pub is_code: bool,
}

impl UserVal {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_code: false,
        }
    }

    pub fn code(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_code: true,
        }
    }
}

/// The full set of user inputs for one process invocation. Built once from
/// parsed command-line matches, read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct Externals {
    /// External variables, retrievable via `std.extVar`
    pub vars: IndexMap<String, UserVal>,
    /// Top-level arguments, applied to the root function of the program
    pub top_level_vars: IndexMap<String, UserVal>,
    /// Library search paths for file imports
    pub lib_paths: Vec<PathBuf>,
    /// Data source URLs, `scheme://name?configVar=...`
    pub data_source_urls: Vec<String>,
}

/// The two variable namespaces. They use the same flag grammar and only
/// differ in the flag prefix and where the variables end up.
const NAMESPACES: &[&str] = &["ext", "tla"];

/// Add the externals flag family to a clap command. `shorthands` gates the
/// `-V`/`-A` aliases for `--ext-str`/`--tla-str`; they collide with flags
/// some host CLIs already use, so the host decides.
pub fn augment_command(mut cmd: Command, shorthands: bool) -> Command {
    for ns in NAMESPACES {
        let (kind, about) = match *ns {
            "ext" => ("external variable", "std.extVar"),
            _ => ("top-level argument", "the root function"),
        };
        let mut str_arg = Arg::new(format!("{ns}-str"))
            .long(format!("{ns}-str"))
            .value_name("NAME[=VALUE]")
            .action(ArgAction::Append)
            .help(format!(
                "Set {kind} NAME (exposed via {about}); without =VALUE the \
                 value is read from the environment"
            ));
        if shorthands {
            str_arg = str_arg.short(match *ns {
                "ext" => 'V',
                _ => 'A',
            });
        }
        cmd = cmd
            .arg(str_arg)
            .arg(
                Arg::new(format!("{ns}-code"))
                    .long(format!("{ns}-code"))
                    .value_name("NAME[=CODE]")
                    .action(ArgAction::Append)
                    .help(format!("Set {kind} NAME to a Jsonnet expression")),
            )
            .arg(
                Arg::new(format!("{ns}-str-file"))
                    .long(format!("{ns}-str-file"))
                    .value_name("NAME=PATH")
                    .action(ArgAction::Append)
                    .help(format!("Set {kind} NAME to the contents of PATH")),
            )
            .arg(
                Arg::new(format!("{ns}-code-file"))
                    .long(format!("{ns}-code-file"))
                    .value_name("NAME=PATH")
                    .action(ArgAction::Append)
                    .help(format!(
                        "Set {kind} NAME to the Jsonnet expression in PATH"
                    )),
            )
            .arg(
                Arg::new(format!("{ns}-str-list"))
                    .long(format!("{ns}-str-list"))
                    .value_name("PATH")
                    .action(ArgAction::Append)
                    .help(format!(
                        "Read newline-separated {ns}-str entries from PATH"
                    )),
            );
    }
    cmd.arg(
        Arg::new("jpath")
            .long("jpath")
            .value_name("DIR")
            .action(ArgAction::Append)
            .help("Add a library search path for imports"),
    )
    .arg(
        Arg::new("data-source")
            .long("data-source")
            .value_name("URL")
            .action(ArgAction::Append)
            .help("Register a data source, scheme://name?configVar=VAR"),
    )
}

impl Externals {
    /// Build externals from parsed matches. Within each namespace, list
    /// files are processed first, then inline strings, then files; later
    /// entries overwrite earlier ones on name collision.
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let mut externals = Self::default();
        for ns in NAMESPACES {
            let vars = match *ns {
                "ext" => &mut externals.vars,
                _ => &mut externals.top_level_vars,
            };
            for file in values(matches, &format!("{ns}-str-list")) {
                process_list(vars, &file)?;
            }
            for spec in values(matches, &format!("{ns}-str")) {
                process_inline(vars, &spec, false)?;
            }
            for spec in values(matches, &format!("{ns}-code")) {
                process_inline(vars, &spec, true)?;
            }
            for spec in values(matches, &format!("{ns}-str-file")) {
                process_file(vars, &format!("{ns}-str-file"), &spec, false)?;
            }
            for spec in values(matches, &format!("{ns}-code-file")) {
                process_file(vars, &format!("{ns}-code-file"), &spec, true)?;
            }
        }
        externals.lib_paths = values(matches, "jpath").map(PathBuf::from).collect();
        externals.data_source_urls = values(matches, "data-source").collect();
        debug!(
            "Ingested {} external and {} top-level variables",
            externals.vars.len(),
            externals.top_level_vars.len()
        );
        Ok(externals)
    }
}

/// Values of a repeatable flag, in the order they were given
fn values(matches: &ArgMatches, id: &str) -> impl Iterator<Item = String> {
    matches
        .get_many::<String>(id)
        .unwrap_or_default()
        .cloned()
        .collect::<Vec<_>>()
        .into_iter()
}

/// Process a `NAME=VALUE` or bare `NAME` spec. A bare name is looked up in
/// the environment, and a missing environment binding is fatal.
fn process_inline(
    vars: &mut IndexMap<String, UserVal>,
    spec: &str,
    is_code: bool,
) -> anyhow::Result<()> {
    let (name, value) = match spec.split_once('=') {
        Some((name, value)) => (name, value.to_owned()),
        None => match env::var(spec) {
            Ok(value) => (spec, value),
            Err(_) => {
                bail!("no value found from environment for {spec}")
            }
        },
    };
    vars.insert(name.to_owned(), UserVal { value, is_code });
    Ok(())
}

/// Process a `NAME=PATH` spec by reading the file at PATH
fn process_file(
    vars: &mut IndexMap<String, UserVal>,
    flag: &str,
    spec: &str,
    is_code: bool,
) -> anyhow::Result<()> {
    let Some((name, path)) = spec.split_once('=') else {
        bail!("{flag} no filename specified for {spec}");
    };
    let value = fs::read_to_string(path)
        .with_context(|| format!("{flag} error reading file {path}"))?;
    vars.insert(name.to_owned(), UserVal { value, is_code });
    Ok(())
}

/// Process a list file: one `NAME[=VALUE]` entry per line, blank lines
/// skipped. Errors carry the 1-based line number.
fn process_list(
    vars: &mut IndexMap<String, UserVal>,
    file: &str,
) -> anyhow::Result<()> {
    let content = fs::read_to_string(file)
        .map_err(|error| anyhow!("process list {file}: {error}"))?;
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        process_inline(vars, line, false)
            .with_context(|| format!("process list {file}, line {}", index + 1))?;
    }
    Ok(())
}
