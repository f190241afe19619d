//! A Jsonnet evaluation engine for configuration pipelines. On top of the
//! plain language this adds external inputs (strings, code snippets, files),
//! glob imports that expand into a map of inner imports, `data://` imports
//! backed by external processes, and a handful of native functions (YAML,
//! regex, helm expansion, label selectors).
//!
//! The Jsonnet runtime itself is [jrsonnet](https://github.com/CertainLach/jrsonnet);
//! this crate only installs variables, importers and native callbacks on it.

pub mod commands;
pub mod eval;
pub mod externals;
pub mod importers;
pub mod natives;
pub mod sources;
#[cfg(test)]
mod test_util;
pub mod variables;
