//! Native functions exposed to Jsonnet programs via `std.native`. All of
//! them receive already-evaluated arguments from the runtime; errors become
//! runtime errors at the call site.

mod helm;
mod selector;

pub use helm::HelmOptions;
pub use selector::Selector;

use indexmap::IndexMap;
use jrsonnet_evaluator::{
    bail, error::Result, function::builtin, manifest::JsonFormat, IStr,
    ObjValue, Val,
};
use jrsonnet_gcmodule::{Trace, Tracer};
use jrsonnet_stdlib::ContextInitializer;
use regex::Regex;
use serde::Deserialize;
use std::{cell::RefCell, collections::HashMap, rc::Rc};

/// Register all native functions on a fresh runtime context. The regex
/// cache lives at the VM level so compiled patterns survive across pooled
/// evaluations.
pub fn register(context: &ContextInitializer, cache: &RegexCache) {
    context.add_native("parseJson", builtin_parse_json::INST);
    context.add_native("parseYaml", builtin_parse_yaml::INST);
    context.add_native("renderYaml", builtin_render_yaml::INST);
    context.add_native(
        "escapeStringRegex",
        builtin_escape_string_regex::INST,
    );
    context.add_native(
        "regexMatch",
        builtin_regex_match {
            cache: cache.clone(),
        },
    );
    context.add_native(
        "regexSubst",
        builtin_regex_subst {
            cache: cache.clone(),
        },
    );
    context.add_native(
        "expandHelmTemplate",
        builtin_expand_helm_template::INST,
    );
    context.add_native(
        "labelsMatchSelector",
        builtin_labels_match_selector::INST,
    );
}

/// Compiled patterns, shared between the regex natives of one VM
#[derive(Clone, Default)]
pub struct RegexCache(Rc<RefCell<HashMap<IStr, Rc<Regex>>>>);

// The cache never holds runtime values, nothing to trace
impl Trace for RegexCache {
    fn trace(&self, _tracer: &mut Tracer) {}

    fn is_type_tracked() -> bool {
        false
    }
}

/// Build a string value from an owned string
fn string_val(s: String) -> Val {
    Val::Str(IStr::from(s).into())
}

impl RegexCache {
    fn compile(&self, pattern: &IStr) -> Result<Rc<Regex>> {
        if let Some(compiled) = self.0.borrow().get(pattern) {
            return Ok(Rc::clone(compiled));
        }
        match Regex::new(pattern) {
            Ok(compiled) => {
                let compiled = Rc::new(compiled);
                self.0
                    .borrow_mut()
                    .insert(pattern.clone(), Rc::clone(&compiled));
                Ok(compiled)
            }
            Err(error) => bail!("invalid regex '{pattern}': {error}"),
        }
    }
}

/// Manifest a runtime value to a JSON text
fn to_json_text(val: &Val) -> Result<String> {
    Ok(val.manifest(JsonFormat::default())?.to_string())
}

/// Convert a runtime value to a plain JSON value
fn to_json_value(val: &Val) -> Result<serde_json::Value> {
    let text = to_json_text(val)?;
    match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(error) => bail!("unexpected manifest output: {error}"),
    }
}

/// Convert a plain JSON value back into a runtime value
fn from_json_value(value: serde_json::Value) -> Result<Val> {
    match serde_json::from_value(value) {
        Ok(val) => Ok(val),
        Err(error) => bail!("error converting value: {error}"),
    }
}

#[builtin]
fn builtin_parse_json(s: IStr) -> Result<Val> {
    match serde_json::from_str(&s) {
        Ok(val) => Ok(val),
        Err(error) => bail!("parseJson: {error}"),
    }
}

/// Parse a YAML multi-document stream into an array with one element per
/// non-null document
fn parse_yaml_stream(s: &str) -> Result<Val> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(s) {
        let value = match serde_json::Value::deserialize(document) {
            Ok(value) => value,
            Err(error) => bail!("parseYaml: {error}"),
        };
        if !value.is_null() {
            documents.push(value);
        }
    }
    from_json_value(serde_json::Value::Array(documents))
}

#[builtin]
fn builtin_parse_yaml(s: IStr) -> Result<Val> {
    parse_yaml_stream(&s)
}

fn render_yaml_document(value: &serde_json::Value) -> Result<String> {
    match serde_yaml::to_string(value) {
        Ok(text) => Ok(text),
        Err(error) => bail!("renderYaml: {error}"),
    }
}

#[builtin]
fn builtin_render_yaml(data: Val) -> Result<Val> {
    let value = to_json_value(&data)?;
    let rendered = match value {
        // A sequence renders as a multi-document stream, one document per
        // non-null element
        serde_json::Value::Array(documents) => {
            let mut out = String::new();
            for document in &documents {
                if document.is_null() {
                    continue;
                }
                out.push_str("---\n");
                out.push_str(&render_yaml_document(document)?);
            }
            out
        }
        document => render_yaml_document(&document)?,
    };
    Ok(string_val(rendered))
}

#[builtin]
fn builtin_escape_string_regex(s: IStr) -> Result<Val> {
    Ok(string_val(regex::escape(&s)))
}

#[builtin(fields(
    cache: RegexCache,
))]
fn builtin_regex_match(
    this: &builtin_regex_match,
    pattern: IStr,
    subject: IStr,
) -> Result<Val> {
    let compiled = this.cache.compile(&pattern)?;
    Ok(Val::Bool(compiled.is_match(&subject)))
}

#[builtin(fields(
    cache: RegexCache,
))]
fn builtin_regex_subst(
    this: &builtin_regex_subst,
    pattern: IStr,
    src: IStr,
    repl: IStr,
) -> Result<Val> {
    let compiled = this.cache.compile(&pattern)?;
    let replaced = compiled.replace_all(&src, repl.as_str());
    Ok(string_val(replaced.into_owned()))
}

#[builtin]
fn builtin_expand_helm_template(
    chart: IStr,
    values: Val,
    opts: ObjValue,
) -> Result<Val> {
    let options: HelmOptions =
        match serde_json::from_str(&to_json_text(&Val::Obj(opts))?) {
            Ok(options) => options,
            Err(error) => bail!("expandHelmTemplate: invalid options: {error}"),
        };
    let values_yaml = render_yaml_document(&to_json_value(&values)?)?;
    match helm::expand_helm_template(&chart, &values_yaml, &options) {
        Ok(output) => parse_yaml_stream(&output),
        Err(error) => bail!("expandHelmTemplate: {error:#}"),
    }
}

#[builtin]
fn builtin_labels_match_selector(
    labels: ObjValue,
    selector: IStr,
) -> Result<Val> {
    let labels: IndexMap<String, serde_json::Value> =
        match serde_json::from_str(&to_json_text(&Val::Obj(labels))?) {
            Ok(labels) => labels,
            Err(error) => bail!("labelsMatchSelector: invalid labels: {error}"),
        };
    let mut string_labels = IndexMap::with_capacity(labels.len());
    for (key, value) in labels {
        match value {
            serde_json::Value::String(value) => {
                string_labels.insert(key, value);
            }
            other => bail!(
                "labelsMatchSelector: label '{key}' is not a string \
                 (got {other})"
            ),
        }
    }
    let selector = match Selector::parse(&selector) {
        Ok(selector) => selector,
        Err(error) => bail!("labelsMatchSelector: {error:#}"),
    };
    Ok(Val::Bool(selector.matches(&string_labels)))
}
