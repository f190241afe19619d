//! `data://` imports, one importer per configured data source. The runtime
//! may import the same data URL many times during one evaluation; the
//! per-importer cache guarantees at most one upstream resolution per
//! distinct subpath.

use crate::importers::{Import, Imported};
use crate::sources::{DataSource, ManagedDataSource};
use anyhow::bail;
use log::trace;
use std::{cell::RefCell, collections::HashMap, path::Path, sync::Arc};

const SCHEME_PREFIX: &str = "data://";

pub struct DataImporter {
    source: Arc<dyn ManagedDataSource>,
    cache: RefCell<HashMap<String, Result<String, String>>>,
}

impl DataImporter {
    pub fn new(source: Arc<dyn ManagedDataSource>) -> Self {
        Self {
            source,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Extract the subpath if the path addresses this importer's source.
    /// `data://name` and `data://name/` both resolve the root path `/`.
    fn subpath<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(SCHEME_PREFIX)?;
        let (name, subpath) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };
        (name == self.source.name()).then_some(subpath)
    }
}

impl Import for DataImporter {
    fn can_process(&self, path: &str) -> bool {
        self.subpath(path).is_some()
    }

    fn import(&self, _base: &Path, path: &str) -> anyhow::Result<Imported> {
        let subpath = self
            .subpath(path)
            .expect("import called without can_process");

        let cached = self.cache.borrow().get(subpath).cloned();
        let result = match cached {
            Some(result) => {
                trace!("Data import {path} served from cache");
                result
            }
            None => {
                let result =
                    self.source.resolve(subpath).map_err(|error| {
                        format!(
                            "data source {}, target={subpath}: {error:#}",
                            self.source.name()
                        )
                    });
                self.cache
                    .borrow_mut()
                    .insert(subpath.to_owned(), result.clone());
                result
            }
        };
        match result {
            Ok(contents) => Ok(Imported {
                contents,
                canonical: path.to_owned(),
                base: None,
            }),
            Err(message) => bail!("{message}"),
        }
    }
}
