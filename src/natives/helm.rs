//! Chart expansion by shelling out to `helm template`. Values are piped to
//! helm as YAML on stdin; the rendered manifests come back on stdout as a
//! YAML stream.

use anyhow::{anyhow, bail, Context};
use log::{debug, info};
use serde::Deserialize;
use std::{
    env,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

/// Options accepted by `expandHelmTemplate`
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelmOptions {
    /// Restrict rendering to these templates (`--show-only`)
    pub execute: Vec<String>,
    pub kube_version: String,
    /// Release name
    pub name: String,
    pub name_template: String,
    pub namespace: String,
    /// File whose directory anchors relative chart paths, usually
    /// `std.thisFile` of the caller
    pub this_file: String,
    pub verbose: bool,
    /// Appended to the helm command line verbatim
    pub extra_args: Vec<String>,
}

impl HelmOptions {
    /// Resolve the chart location. Relative charts are anchored at the
    /// directory of `thisFile`; without it the temp directory is used,
    /// which deliberately breaks relative paths rather than letting them
    /// accidentally resolve against the working directory.
    fn chart_path(&self, chart: &str) -> PathBuf {
        let chart = Path::new(chart);
        if chart.is_absolute() {
            return chart.to_owned();
        }
        let base = if self.this_file.is_empty() {
            env::temp_dir()
        } else {
            Path::new(&self.this_file)
                .parent()
                .map(Path::to_owned)
                .unwrap_or_else(env::temp_dir)
        };
        base.join(chart)
    }

    fn to_args(&self, chart: &str) -> Vec<String> {
        let mut args = vec!["template".to_owned()];
        if !self.name.is_empty() {
            args.push(self.name.clone());
        }
        args.push(self.chart_path(chart).display().to_string());
        for execute in &self.execute {
            args.push("--show-only".to_owned());
            args.push(execute.clone());
        }
        if !self.kube_version.is_empty() {
            args.push("--kube-version".to_owned());
            args.push(self.kube_version.clone());
        }
        if !self.name_template.is_empty() {
            args.push("--name-template".to_owned());
            args.push(self.name_template.clone());
        }
        if !self.namespace.is_empty() {
            args.push("--namespace".to_owned());
            args.push(self.namespace.clone());
        }
        if self.verbose {
            args.push("--debug".to_owned());
        }
        args.extend(self.extra_args.iter().cloned());
        // Values arrive on stdin
        args.push("--values".to_owned());
        args.push("-".to_owned());
        args
    }
}

/// Run the chart-templating tool and return its raw YAML output
pub fn expand_helm_template(
    chart: &str,
    values_yaml: &str,
    options: &HelmOptions,
) -> anyhow::Result<String> {
    let args = options.to_args(chart);
    info!("Expanding chart {chart} with helm {}", args.join(" "));
    let mut child = Command::new("helm")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // Forward stderr to the user, in case something goes wrong
        .stderr(Stdio::inherit())
        .spawn()
        .context("error running helm")?;
    child
        .stdin
        .take()
        .expect("child stdin is piped")
        .write_all(values_yaml.as_bytes())
        .context("error writing values to helm")?;
    let output = child.wait_with_output().context("error waiting for helm")?;
    if !output.status.success() {
        bail!("helm template failed: {}", output.status);
    }
    debug!("helm produced {} bytes of output", output.stdout.len());
    String::from_utf8(output.stdout)
        .map_err(|error| anyhow!("error decoding helm output: {error}"))
}
