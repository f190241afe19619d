//! All CLI subcommands are defined here. One sub-module per subcommand.
//! Common components that are specific to subcommands (and not the CLI as
//! a whole) are in this root module.

use crate::{
    commands::{eval::EvalCommand, lint::LintCommand},
    eval::Evaluator,
    externals::Externals,
    sources::{create_data_source, ManagedDataSource},
    variables::VariableSet,
};
use clap::{ArgMatches, Subcommand};
use log::warn;
use std::{process, sync::Arc};

mod eval;
mod lint;

/// Subcommand to execute
#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    Eval(EvalCommand),
    Lint(LintCommand),
}

impl Commands {
    pub fn execute(self, matches: &ArgMatches) -> anyhow::Result<()> {
        match self {
            Self::Eval(command) => {
                // The externals flag family is attached to the eval
                // subcommand with the builder API, so its values live in
                // the subcommand matches
                let matches = matches
                    .subcommand_matches("eval")
                    .expect("eval subcommand matched");
                command.execute(matches)
            }
            Self::Lint(command) => command.execute(),
        }
    }
}

/// Data container with helper methods for subcommands that evaluate
pub struct CommandContext {
    pub evaluator: Evaluator,
    pub variables: VariableSet,
    sources: Vec<Arc<dyn ManagedDataSource>>,
}

impl CommandContext {
    pub fn new(externals: &Externals) -> anyhow::Result<Self> {
        let mut sources = Vec::new();
        for url in &externals.data_source_urls {
            sources.push(create_data_source(url)?);
        }
        let evaluator =
            Evaluator::new(externals.lib_paths.clone(), sources.clone());
        let variables = VariableSet::from_externals(externals);

        // Hand every source its config provider; actual driver startup is
        // deferred to the first resolution
        let provider = evaluator.config_provider(&variables);
        for source in &sources {
            source.init(Arc::clone(&provider))?;
        }

        // Data sources own child processes; make sure an interrupt doesn't
        // leak them
        let closers = sources.clone();
        ctrlc::set_handler(move || {
            close_sources(&closers);
            process::exit(130);
        })?;

        Ok(Self {
            evaluator,
            variables,
            sources,
        })
    }

    /// Release all data sources. Runs in reverse creation order, like
    /// deferred cleanup would.
    pub fn close(&self) {
        close_sources(&self.sources);
    }
}

fn close_sources(sources: &[Arc<dyn ManagedDataSource>]) {
    use crate::sources::DataSource;
    for source in sources.iter().rev() {
        if let Err(error) = source.close() {
            warn!("Error closing data source {}: {error:#}", source.name());
        }
    }
}
