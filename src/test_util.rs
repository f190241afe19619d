//! Utilities for tests!

use crate::{
    externals,
    sources::{ConfigProvider, DataSource, ManagedDataSource},
};
use clap::ArgMatches;
use indexmap::IndexMap;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Parse externals-style arguments the way the CLI would (with shorthand
/// flags enabled)
pub fn matches_for(args: &[&str]) -> ArgMatches {
    externals::augment_command(clap::Command::new("test"), true)
        .get_matches_from(std::iter::once("test").chain(args.iter().copied()))
}

/// Write a file, creating parent directories as needed
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

/// Helper for building a string-to-string IndexMap
pub fn string_map<const N: usize>(
    items: [(&str, &str); N],
) -> IndexMap<String, String> {
    items
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

/// Config provider returning fixed documents
#[derive(Default)]
pub struct StaticProvider {
    config: String,
    variables: String,
}

impl StaticProvider {
    pub fn with_config(config: &str) -> Self {
        Self {
            config: config.to_owned(),
            variables: String::new(),
        }
    }
}

impl ConfigProvider for StaticProvider {
    fn config(&self, _name: &str) -> anyhow::Result<String> {
        Ok(self.config.clone())
    }

    fn variables_json(&self) -> anyhow::Result<String> {
        if self.variables.is_empty() {
            Ok("{}".to_owned())
        } else {
            Ok(self.variables.clone())
        }
    }
}

/// Data source serving a fixed path-to-content map
pub struct MapSource {
    name: String,
    entries: IndexMap<String, String>,
}

impl MapSource {
    pub fn new<const N: usize>(
        name: &str,
        entries: [(&str, &str); N],
    ) -> Arc<dyn ManagedDataSource> {
        Arc::new(Self {
            name: name.to_owned(),
            entries: string_map(entries),
        })
    }
}

impl DataSource for MapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> anyhow::Result<String> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no entry for {path}"))
    }
}

impl ManagedDataSource for MapSource {
    fn init(&self, _provider: Arc<dyn ConfigProvider>) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
