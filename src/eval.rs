//! The evaluation facade: `eval_file`, `eval_code` and `lint_code` over a
//! pool of runtime instances, safe for use from many threads at once.
//!
//! jrsonnet states are reference-counted and single-threaded, so the pool
//! is sharded per thread, the same way Go's `sync.Pool` shards per
//! processor. What actually makes a pooled VM worth keeping is not the
//! state object (those are cheap) but its importer caches: glob expansions
//! and resolved data imports persist across evaluations, while each
//! evaluation binds its own variables onto a fresh state, so bindings from
//! one run can never leak into the next.

use crate::{
    importers::{CompositeImporter, ResolverHandle},
    natives::{self, RegexCache},
    sources::{ConfigProvider, ManagedDataSource},
    variables::{VariableSet, VarKind},
};
use anyhow::{anyhow, bail};
use derive_more::{Deref, Display, From};
use indexmap::IndexMap;
use jrsonnet_evaluator::{
    apply_tla, manifest::JsonFormat, trace::PathResolver, State,
};
use jrsonnet_parser::{ParserSettings, Source};
use jrsonnet_stdlib::ContextInitializer;
use log::debug;
use std::{
    cell::RefCell,
    fs, io,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// In-memory Jsonnet source. A separate type so the facade can't confuse
/// snippets with file paths.
#[derive(Clone, Debug, Deref, Display, From)]
pub struct Code(String);

impl From<&str> for Code {
    fn from(code: &str) -> Self {
        Self(code.to_owned())
    }
}

/// Evaluates Jsonnet programs against a fixed set of library paths and
/// data sources. Cheap to clone and safe to share across threads; each
/// thread transparently gets its own pooled VM instances.
#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<EvaluatorInner>,
}

struct EvaluatorInner {
    /// Distinguishes this evaluator's pooled VMs from other evaluators'
    id: u64,
    lib_paths: Vec<PathBuf>,
    sources: Vec<Arc<dyn ManagedDataSource>>,
}

static NEXT_EVALUATOR_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Per-thread free list of pooled VMs. Unbounded; VM instances are
    /// cheap to keep and valuable to reuse.
    static VM_POOL: RefCell<Vec<(u64, Vm)>> = const { RefCell::new(Vec::new()) };
}

impl Evaluator {
    pub fn new(
        lib_paths: Vec<PathBuf>,
        sources: Vec<Arc<dyn ManagedDataSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(EvaluatorInner {
                id: NEXT_EVALUATOR_ID.fetch_add(1, Ordering::Relaxed),
                lib_paths,
                sources,
            }),
        }
    }

    /// Evaluate a Jsonnet file and return the manifested JSON
    pub fn eval_file(
        &self,
        path: &Path,
        vars: &VariableSet,
    ) -> anyhow::Result<String> {
        let metadata = fs::metadata(path).map_err(|error| {
            if error.kind() == io::ErrorKind::NotFound {
                anyhow!("file not found: {}", path.display())
            } else {
                anyhow!("error reading {}: {error}", path.display())
            }
        })?;
        if metadata.is_dir() {
            bail!("{} is a directory, expected a file", path.display());
        }
        self.with_vm(|vm| vm.evaluate(Target::File(path), vars))
    }

    /// Evaluate an in-memory snippet. The name is only used in diagnostics.
    pub fn eval_code(
        &self,
        name: &str,
        code: &Code,
        vars: &VariableSet,
    ) -> anyhow::Result<String> {
        self.with_vm(|vm| {
            vm.evaluate(
                Target::Code {
                    name,
                    code: code.as_str(),
                },
                vars,
            )
        })
    }

    /// Check a snippet without evaluating it. Parse failures are returned
    /// as-is; the parser has been observed to panic on pathological inputs,
    /// which is caught and reported as a linter panic.
    pub fn lint_code(&self, name: &str, code: &Code) -> anyhow::Result<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let source = Source::new_virtual(name.into(), code.as_str().into());
            jrsonnet_parser::parse(code, &ParserSettings { source }).map(|_| ())
        }));
        match outcome {
            Err(_) => bail!("{name}: linter panic"),
            Ok(Err(error)) => bail!("{name}: {error}"),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// A config provider for data source drivers, reading driver
    /// configuration from this evaluator's user variables. Top-level
    /// arguments are excluded; they belong to entrypoint invocation, not
    /// to driver configuration.
    pub fn config_provider(
        &self,
        vars: &VariableSet,
    ) -> Arc<dyn ConfigProvider> {
        Arc::new(EvaluatorConfigProvider {
            evaluator: self.clone(),
            vars: vars.without_top_level(),
        })
    }

    /// Run a closure against a pooled VM, returning the VM afterwards
    fn with_vm<T>(&self, f: impl FnOnce(&Vm) -> T) -> T {
        let vm = self.acquire();
        let result = f(&vm);
        self.release(vm);
        result
    }

    fn acquire(&self) -> Vm {
        let pooled = VM_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.iter()
                .position(|(id, _)| *id == self.inner.id)
                .map(|index| pool.swap_remove(index).1)
        });
        pooled.unwrap_or_else(|| Vm::new(&self.inner))
    }

    fn release(&self, vm: Vm) {
        VM_POOL.with(|pool| pool.borrow_mut().push((self.inner.id, vm)));
    }
}

/// What to evaluate
enum Target<'a> {
    File(&'a Path),
    Code { name: &'a str, code: &'a str },
}

/// One pooled runtime instance. Owns the composite importer (and through
/// it the glob and data caches) and the compiled-regex cache; none of
/// these are shared across threads.
struct Vm {
    resolver: Rc<CompositeImporter>,
    regex_cache: RegexCache,
}

impl Vm {
    fn new(config: &EvaluatorInner) -> Self {
        debug!("Creating VM for evaluator {}", config.id);
        Self {
            resolver: Rc::new(CompositeImporter::new(
                config.lib_paths.clone(),
                &config.sources,
            )),
            regex_cache: RegexCache::default(),
        }
    }

    fn evaluate(
        &self,
        target: Target<'_>,
        vars: &VariableSet,
    ) -> anyhow::Result<String> {
        // Binding variables builds a fresh state over this VM's persistent
        // importer and regex caches; previous bindings are gone wholesale
        let context = ContextInitializer::new(PathResolver::Absolute);
        vars.register(&context);
        natives::register(&context, &self.regex_cache);
        let mut builder = State::builder();
        builder
            .import_resolver(ResolverHandle(Rc::clone(&self.resolver)))
            .context_initializer(context);
        let state = builder.build();

        let value = match target {
            Target::File(path) => state.import(path),
            Target::Code { name, code } => {
                state.evaluate_snippet(name.to_owned(), code)
            }
        }
        .map_err(|error| anyhow!("{error}"))?;

        let tla_args = vars.tla_args();
        let value = if tla_args.is_empty() {
            value
        } else {
            apply_tla(state.clone(), &tla_args, value)
                .map_err(|error| anyhow!("{error}"))?
        };

        let json = value
            .manifest(JsonFormat::default())
            .map_err(|error| anyhow!("{error}"))?;
        Ok(json.to_string())
    }
}

/// Reads data source configuration out of user variables by evaluating
/// `std.extVar` through the owning evaluator
struct EvaluatorConfigProvider {
    evaluator: Evaluator,
    vars: VariableSet,
}

impl ConfigProvider for EvaluatorConfigProvider {
    fn config(&self, name: &str) -> anyhow::Result<String> {
        if !self.vars.has_var(name) {
            bail!("no variable '{name}' defined for data source configuration");
        }
        let code = Code::from(format!(
            "std.extVar({})",
            serde_json::to_string(name)?
        ));
        let document = self.evaluator.eval_code(
            &format!("<data-source-config:{name}>"),
            &code,
            &self.vars,
        )?;
        // A plain-string variable manifests as a quoted JSON string;
        // unwrap it so string and code variables can both carry a config
        // document
        if let Ok(serde_json::Value::String(inner)) =
            serde_json::from_str(&document)
        {
            return Ok(inner);
        }
        Ok(document)
    }

    fn variables_json(&self) -> anyhow::Result<String> {
        let variables: IndexMap<String, String> = self
            .vars
            .vars()
            .into_iter()
            .filter(|var| var.kind == VarKind::String)
            .map(|var| (var.name, var.value))
            .collect();
        Ok(serde_json::to_string(&variables)?)
    }
}
