use crate::{commands::CommandContext, externals::Externals};
use clap::{ArgMatches, Parser};

/// Evaluate a Jsonnet file and print the resulting JSON
///
/// External variables and top-level arguments come from the --ext-* and
/// --tla-* flag families; imports beyond plain files are served by glob
/// patterns (glob-import:, glob-importstr:) and registered data sources
/// (data://name/path).
#[derive(Clone, Debug, Parser)]
#[clap(visible_alias = "e")]
pub struct EvalCommand {
    /// Jsonnet file to evaluate
    file: std::path::PathBuf,
}

impl EvalCommand {
    pub fn execute(self, matches: &ArgMatches) -> anyhow::Result<()> {
        let externals = Externals::from_matches(matches)?;
        let context = CommandContext::new(&externals)?;
        let result = context
            .evaluator
            .eval_file(&self.file, &context.variables);
        // Children die before the result is reported, success or not
        context.close();
        println!("{}", result?);
        Ok(())
    }
}
