//! Variable sets: the immutable bag of external and top-level variables
//! that gets bound onto a Jsonnet runtime for each evaluation. Cloning is
//! cheap and every mutator returns a new set, so sets can be freely shared
//! between concurrent evaluations.

use crate::externals::Externals;
use indexmap::IndexMap;
use jrsonnet_evaluator::{function::TlaArg, gc::GcHashMap, IStr};
use jrsonnet_parser::{ParserSettings, Source};
use jrsonnet_stdlib::ContextInitializer;
use log::trace;
use std::fmt::{Display, Formatter};

/// How a variable's value should be interpreted by the runtime
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VarKind {
    /// A plain string, bound as-is
    String,
    /// A Jsonnet expression, evaluated lazily on first reference
    Code,
}

/// A single named variable
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Var {
    pub name: String,
    pub kind: VarKind,
    pub value: String,
}

impl Var {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::String,
            value: value.into(),
        }
    }

    pub fn code(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::Code,
            value: value.into(),
        }
    }
}

impl Display for Var {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            VarKind::String => write!(f, "{} = \"{}\"", self.name, self.value),
            VarKind::Code => write!(f, "{} = {}", self.name, self.value),
        }
    }
}

/// An immutable collection of external and top-level variables. The two
/// namespaces are independent: a name in one does not mask the same name in
/// the other. Mutators clone; within a namespace the last write wins.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VariableSet {
    vars: IndexMap<String, Var>,
    top_level_vars: IndexMap<String, Var>,
}

impl VariableSet {
    /// Derive a variable set from ingested externals
    pub fn from_externals(externals: &Externals) -> Self {
        fn convert(
            source: &IndexMap<String, crate::externals::UserVal>,
        ) -> IndexMap<String, Var> {
            source
                .iter()
                .map(|(name, user_val)| {
                    let var = if user_val.is_code {
                        Var::code(name, &user_val.value)
                    } else {
                        Var::string(name, &user_val.value)
                    };
                    (name.clone(), var)
                })
                .collect()
        }
        Self {
            vars: convert(&externals.vars),
            top_level_vars: convert(&externals.top_level_vars),
        }
    }

    /// Snapshot of the external variables
    pub fn vars(&self) -> Vec<Var> {
        self.vars.values().cloned().collect()
    }

    /// Snapshot of the top-level variables
    pub fn top_level_vars(&self) -> Vec<Var> {
        self.top_level_vars.values().cloned().collect()
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn has_top_level_var(&self, name: &str) -> bool {
        self.top_level_vars.contains_key(name)
    }

    /// Clone this set with additional external variables merged in
    pub fn with_vars(&self, vars: impl IntoIterator<Item = Var>) -> Self {
        let mut merged = self.clone();
        merged
            .vars
            .extend(vars.into_iter().map(|var| (var.name.clone(), var)));
        merged
    }

    /// Clone this set with additional top-level variables merged in
    pub fn with_top_level_vars(
        &self,
        vars: impl IntoIterator<Item = Var>,
    ) -> Self {
        let mut merged = self.clone();
        merged
            .top_level_vars
            .extend(vars.into_iter().map(|var| (var.name.clone(), var)));
        merged
    }

    /// Clone this set with an empty top-level namespace. When there are no
    /// top-level variables to begin with, the clone is indistinguishable
    /// from the receiver.
    pub fn without_top_level(&self) -> Self {
        if self.top_level_vars.is_empty() {
            return self.clone();
        }
        Self {
            vars: self.vars.clone(),
            top_level_vars: IndexMap::new(),
        }
    }

    /// Bind the external variables onto a runtime context. Code values are
    /// parsed here, but a malformed snippet must only fail when the program
    /// references it; since the runtime insists on parsing code variables
    /// eagerly, a snippet that fails to parse is re-registered as an
    /// `error` expression carrying the parse failure.
    pub(crate) fn register(&self, context: &ContextInitializer) {
        for var in self.vars.values() {
            trace!("Registering external variable {var}");
            match var.kind {
                VarKind::String => context.add_ext_str(
                    var.name.as_str().into(),
                    var.value.as_str().into(),
                ),
                VarKind::Code => {
                    if let Err(error) =
                        context.add_ext_code(var.name.as_str(), var.value.as_str())
                    {
                        context
                            .add_ext_code(
                                var.name.as_str(),
                                deferred_error(&format!(
                                    "invalid code in external variable {}: {}",
                                    var.name, error
                                ))
                                .as_str(),
                            )
                            .expect("error expression always parses");
                    }
                }
            }
        }
    }

    /// Build the top-level argument map for this set, for `apply_tla`
    pub(crate) fn tla_args(&self) -> GcHashMap<IStr, TlaArg> {
        let mut args = GcHashMap::new();
        for var in self.top_level_vars.values() {
            trace!("Registering top-level argument {var}");
            let name: IStr = var.name.as_str().into();
            match var.kind {
                VarKind::String => {
                    args.insert(name, TlaArg::String(var.value.as_str().into()));
                }
                VarKind::Code => {
                    args.insert(name, parse_tla_code(&var.name, &var.value));
                }
            }
        }
        args
    }
}

/// Parse a top-level code argument, falling back to a deferred error
/// expression when the snippet itself does not parse
fn parse_tla_code(name: &str, code: &str) -> TlaArg {
    match parse_snippet(&format!("<top-level-arg:{name}>"), code) {
        Ok(parsed) => TlaArg::Code(parsed),
        Err(error) => {
            let code = deferred_error(&format!(
                "invalid code in top-level argument {name}: {error}"
            ));
            TlaArg::Code(
                parse_snippet(&format!("<top-level-arg:{name}>"), &code)
                    .expect("error expression always parses"),
            )
        }
    }
}

fn parse_snippet(
    name: &str,
    code: &str,
) -> Result<jrsonnet_parser::LocExpr, jrsonnet_parser::ParseError> {
    let source = Source::new_virtual(name.into(), code.into());
    jrsonnet_parser::parse(code, &ParserSettings { source })
}

/// A Jsonnet expression that raises the given message when evaluated.
/// JSON string quoting is valid Jsonnet quoting.
fn deferred_error(message: &str) -> String {
    format!(
        "error {}",
        serde_json::to_string(message).expect("string serialization")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> VariableSet {
        VariableSet::default()
            .with_vars([Var::string("a", "1"), Var::code("b", "{x: 1}")])
            .with_top_level_vars([Var::string("t", "2")])
    }

    #[test]
    fn test_namespaces_are_independent() {
        let set = sample().with_top_level_vars([Var::string("a", "other")]);
        assert!(set.has_var("a"));
        assert!(set.has_top_level_var("a"));
        assert_eq!(
            set.vars().iter().find(|var| var.name == "a").unwrap().value,
            "1"
        );
    }

    #[test]
    fn test_with_vars_last_write_wins() {
        let set = sample().with_vars([Var::string("a", "overwritten")]);
        assert_eq!(
            set.vars().iter().find(|var| var.name == "a").unwrap().value,
            "overwritten"
        );
        // The original is untouched
        assert_eq!(
            sample()
                .vars()
                .iter()
                .find(|var| var.name == "a")
                .unwrap()
                .value,
            "1"
        );
    }

    #[test]
    fn test_without_top_level() {
        let set = sample().without_top_level();
        assert!(!set.has_top_level_var("t"));
        assert!(set.has_var("a"));
    }

    #[test]
    fn test_without_top_level_identity_when_empty() {
        let set = VariableSet::default().with_vars([Var::string("a", "1")]);
        assert_eq!(set.without_top_level(), set);
    }

    #[test]
    fn test_tla_args_contains_all_top_level() {
        let set = sample().with_top_level_vars([Var::code("u", "1 + 1")]);
        let args = set.tla_args();
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_malformed_tla_code_is_deferred() {
        // Registration must not fail; the error fires on reference
        let set =
            VariableSet::default().with_top_level_vars([Var::code("bad", "{")]);
        assert_eq!(set.tla_args().len(), 1);
    }

    #[test]
    fn test_deferred_error_quotes_message() {
        assert_eq!(
            deferred_error(r#"oh "no""#),
            r#"error "oh \"no\"""#
        );
    }
}
