//! Label selector matching, the subset of expressions used to select
//! cluster workloads: presence/absence, (in)equality, set membership, all
//! joined by commas.

use anyhow::bail;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::OnceLock;

/// One requirement of a parsed selector
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Requirement {
    Exists(String),
    NotExists(String),
    Equal(String, String),
    NotEqual(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        match self {
            Self::Exists(key) => labels.contains_key(key),
            Self::NotExists(key) => !labels.contains_key(key),
            Self::Equal(key, value) => labels.get(key) == Some(value),
            Self::NotEqual(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels
                .get(key)
                .is_some_and(|value| values.contains(value)),
            Self::NotIn(key, values) => !labels
                .get(key)
                .is_some_and(|value| values.contains(value)),
        }
    }
}

/// A parsed selector: the conjunction of its requirements
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Selector(Vec<Requirement>);

impl Selector {
    /// Parse a selector expression like `env in (dev, prod), !legacy`
    pub fn parse(selector: &str) -> anyhow::Result<Self> {
        let mut requirements = Vec::new();
        for clause in split_clauses(selector)? {
            let clause = clause.trim();
            if clause.is_empty() {
                bail!("invalid selector '{selector}': empty clause");
            }
            requirements.push(parse_clause(clause)?);
        }
        Ok(Self(requirements))
    }

    /// Whether the given labels satisfy every requirement. The empty
    /// selector matches everything.
    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        self.0.iter().all(|requirement| requirement.matches(labels))
    }
}

/// Split on commas that are not inside a value list
fn split_clauses(selector: &str) -> anyhow::Result<Vec<&str>> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, ch) in selector.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    anyhow::anyhow!("invalid selector '{selector}': unbalanced ')'")
                })?;
            }
            ',' if depth == 0 => {
                clauses.push(&selector[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        bail!("invalid selector '{selector}': unbalanced '('");
    }
    clauses.push(&selector[start..]);
    // A fully empty selector has no requirements at all
    if clauses.len() == 1 && clauses[0].trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(clauses)
}

fn set_expression() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?<key>\S+)\s+(?<op>in|notin)\s+\((?<values>[^)]*)\)$")
            .expect("static regex")
    })
}

fn parse_clause(clause: &str) -> anyhow::Result<Requirement> {
    // Set membership first; its keys would otherwise be misread as
    // presence checks with trailing garbage
    if let Some(captures) = set_expression().captures(clause) {
        let key = validate_key(&captures["key"])?;
        let values = captures["values"]
            .split(',')
            .map(|value| validate_value(value.trim()).map(str::to_owned))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if values.is_empty() {
            bail!("invalid selector clause '{clause}': empty value list");
        }
        return Ok(match &captures["op"] {
            "in" => Requirement::In(key.to_owned(), values),
            _ => Requirement::NotIn(key.to_owned(), values),
        });
    }

    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement::NotEqual(
            validate_key(key.trim())?.to_owned(),
            validate_value(value.trim())?.to_owned(),
        ));
    }
    // Accept both = and ==
    if let Some((key, value)) = clause.split_once('=') {
        let value = value.strip_prefix('=').unwrap_or(value);
        return Ok(Requirement::Equal(
            validate_key(key.trim())?.to_owned(),
            validate_value(value.trim())?.to_owned(),
        ));
    }
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(Requirement::NotExists(validate_key(key.trim())?.to_owned()));
    }
    Ok(Requirement::Exists(validate_key(clause)?.to_owned()))
}

/// Label keys: alphanumeric segments with `-`, `_`, `.` in the middle,
/// optionally prefixed `domain/`
fn validate_key(key: &str) -> anyhow::Result<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"^([A-Za-z0-9][A-Za-z0-9.-]*/)?[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$",
        )
        .expect("static regex")
    });
    if !re.is_match(key) {
        bail!("invalid label key '{key}'");
    }
    Ok(key)
}

/// Label values: empty, or alphanumeric with `-`, `_`, `.` in the middle
fn validate_value(value: &str) -> anyhow::Result<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?)?$")
            .expect("static regex")
    });
    if !re.is_match(value) {
        bail!("invalid label value '{value}'");
    }
    Ok(value)
}
