//! Data sources: external providers that turn an import path into content.
//! A source is created from a URL at startup, initialized lazily on first
//! use (its configuration lives in a user variable that may not be
//! evaluable until all sources are registered), and closed at shutdown.

mod exec;
mod http;

pub use exec::ExecSource;
pub use http::ExecHttpSource;

use anyhow::{anyhow, bail, Context};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use url::Url;

/// Callback through which a driver reads its own configuration. Backed by
/// the evaluator, so the config variable may be arbitrary Jsonnet.
pub trait ConfigProvider: Send + Sync {
    /// Evaluate the named user variable and return it as a JSON document
    fn config(&self, name: &str) -> anyhow::Result<String>;

    /// The currently-bound external string variables as a flat JSON object.
    /// Handed to long-running children on stdin.
    fn variables_json(&self) -> anyhow::Result<String>;
}

/// An external provider of content for `data://` imports. A single source
/// instance may serve many concurrent `resolve` calls.
pub trait DataSource: Send + Sync {
    /// The source name, equal to the host component of its URL
    fn name(&self) -> &str;

    /// Resolve a path (always starting with `/`) into content
    fn resolve(&self, path: &str) -> anyhow::Result<String>;
}

/// A data source with a lifecycle: initialized before first use and closed
/// at shutdown. Drivers own their child processes and scratch directories
/// exclusively and release them in `close`.
pub trait ManagedDataSource: DataSource {
    /// Initialize the driver from its configuration variable
    fn init(&self, provider: Arc<dyn ConfigProvider>) -> anyhow::Result<()>;

    /// Release child processes and scratch state. Idempotent.
    fn close(&self) -> anyhow::Result<()>;
}

impl std::fmt::Debug for dyn ManagedDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ManagedDataSource").field(&self.name()).finish()
    }
}

/// Create a data source from a URL of the form
/// `scheme://name[/...]?configVar=VAR`. The returned source defers driver
/// initialization until the first `resolve` call.
pub fn create_data_source(
    url: &str,
) -> anyhow::Result<Arc<dyn ManagedDataSource>> {
    let parsed = Url::parse(url)
        .with_context(|| format!("invalid data source URL '{url}'"))?;
    // `scheme:name` parses, but as an opaque URL with no authority
    if parsed.cannot_be_a_base() {
        bail!(
            "invalid data source URL '{url}', did you forget the '//' \
             after the ':'?"
        );
    }
    let name = parsed.host_str().unwrap_or_default();
    if name.is_empty() {
        bail!("data source URL '{url}' does not have a name");
    }
    let config_var = parsed
        .query_pairs()
        .find(|(key, _)| key == "configVar")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| {
            anyhow!("data source URL '{url}' must have a configVar param")
        })?;

    let delegate: Box<dyn ManagedDataSource> = match parsed.scheme() {
        "exec" => Box::new(ExecSource::new(name, &config_var)),
        "exec-http" => Box::new(ExecHttpSource::new(name, &config_var)),
        scheme => bail!("data source URL '{url}': unsupported scheme {scheme}"),
    };
    debug!("Created {} data source {name}", parsed.scheme());
    Ok(Arc::new(LazySource::new(delegate)))
}

/// Initialization progress of a lazy source
enum InitState {
    /// `init` has not been called yet
    Unregistered,
    /// Provider recorded, delegate untouched
    Registered(Arc<dyn ConfigProvider>),
    /// Delegate initialization ran; a failure is sticky and every
    /// subsequent `resolve` returns the same message
    Done(Result<(), String>),
}

/// Wrapper deferring a driver's initialization to the first `resolve`.
/// The config provider is typically an evaluator reading user variables
/// that are not bindable until all sources exist; deferring breaks that
/// bootstrap circularity.
pub struct LazySource {
    delegate: Box<dyn ManagedDataSource>,
    state: Mutex<InitState>,
}

impl LazySource {
    pub fn new(delegate: Box<dyn ManagedDataSource>) -> Self {
        Self {
            delegate,
            state: Mutex::new(InitState::Unregistered),
        }
    }

    /// Run the delegate's init exactly once; concurrent callers block on
    /// the mutex and observe the first caller's outcome.
    fn ensure_initialized(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("lazy init lock");
        match &*state {
            InitState::Unregistered => {
                bail!("data source {} used before registration", self.name())
            }
            InitState::Registered(provider) => {
                debug!("Initializing data source {}", self.name());
                let result = self.delegate.init(Arc::clone(provider));
                let stored = result
                    .as_ref()
                    .map(|_| ())
                    .map_err(|error| format!("{error:#}"));
                *state = InitState::Done(stored);
                result
            }
            InitState::Done(Ok(())) => Ok(()),
            InitState::Done(Err(message)) => Err(anyhow!("{message}")),
        }
    }
}

impl DataSource for LazySource {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn resolve(&self, path: &str) -> anyhow::Result<String> {
        self.ensure_initialized()?;
        self.delegate.resolve(path)
    }
}

impl ManagedDataSource for LazySource {
    fn init(&self, provider: Arc<dyn ConfigProvider>) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("lazy init lock");
        if let InitState::Unregistered = &*state {
            *state = InitState::Registered(provider);
        } else {
            warn!("Data source {} registered twice", self.name());
        }
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.delegate.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::StaticProvider;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that counts init calls and optionally fails them
    struct CountingSource {
        init_calls: Arc<AtomicUsize>,
        fail_init: bool,
    }

    impl CountingSource {
        fn new(fail_init: bool) -> (Self, Arc<AtomicUsize>) {
            let init_calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    init_calls: Arc::clone(&init_calls),
                    fail_init,
                },
                init_calls,
            )
        }
    }

    impl DataSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn resolve(&self, path: &str) -> anyhow::Result<String> {
            Ok(format!("resolved {path}"))
        }
    }

    impl ManagedDataSource for CountingSource {
        fn init(
            &self,
            _provider: Arc<dyn ConfigProvider>,
        ) -> anyhow::Result<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                bail!("init exploded");
            }
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn provider() -> Arc<dyn ConfigProvider> {
        Arc::new(StaticProvider::default())
    }

    #[test]
    fn test_url_missing_slashes() {
        let error =
            create_data_source("exec:replay?configVar=cfg").unwrap_err();
        assert!(
            error
                .to_string()
                .contains("did you forget the '//' after the ':'"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn test_url_missing_name() {
        let error = create_data_source("exec://?configVar=cfg").unwrap_err();
        assert!(
            error.to_string().contains("does not have a name"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn test_url_missing_config_var() {
        let error = create_data_source("exec://replay").unwrap_err();
        assert!(
            error.to_string().contains("must have a configVar param"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn test_url_unsupported_scheme() {
        let error =
            create_data_source("ftp://replay?configVar=cfg").unwrap_err();
        assert!(
            error.to_string().contains("unsupported scheme"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn test_name_is_host_component() {
        for scheme in ["exec", "exec-http"] {
            let source =
                create_data_source(&format!("{scheme}://replay?configVar=c"))
                    .unwrap();
            assert_eq!(source.name(), "replay");
        }
    }

    #[test]
    fn test_resolve_before_registration() {
        let (delegate, _) = CountingSource::new(false);
        let source = LazySource::new(Box::new(delegate));
        let error = source.resolve("/x").unwrap_err();
        assert!(error.to_string().contains("before registration"));
    }

    #[test]
    fn test_init_runs_once() {
        let (delegate, init_calls) = CountingSource::new(false);
        let source = Arc::new(LazySource::new(Box::new(delegate)));
        source.init(provider()).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    source.resolve(&format!("/{i}")).unwrap()
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_init_is_sticky() {
        let (delegate, init_calls) = CountingSource::new(true);
        let source = LazySource::new(Box::new(delegate));
        source.init(provider()).unwrap();

        let first = source.resolve("/a").unwrap_err();
        assert!(first.to_string().contains("init exploded"));
        // Same error, no retry
        let second = source.resolve("/b").unwrap_err();
        assert_eq!(format!("{second:#}"), format!("{first:#}"));
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }
}
