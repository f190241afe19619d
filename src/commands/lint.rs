use crate::eval::Evaluator;
use anyhow::Context;
use clap::Parser;
use std::{fs, path::PathBuf};

/// Check a Jsonnet file for syntax errors without evaluating it
#[derive(Clone, Debug, Parser)]
pub struct LintCommand {
    /// Jsonnet file to check
    file: PathBuf,
}

impl LintCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let code = fs::read_to_string(&self.file)
            .with_context(|| format!("error reading {}", self.file.display()))?;
        let evaluator = Evaluator::new(Vec::new(), Vec::new());
        evaluator
            .lint_code(&self.file.display().to_string(), &code.into())
    }
}
