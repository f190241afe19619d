//! Import resolution. A composite router owns an ordered list of importers
//! and delegates each request to the first one whose `can_process` accepts
//! the path; everything that falls through lands in the plain filesystem
//! importer, which accepts unconditionally and therefore must come last.
//!
//! The composite doubles as the jrsonnet [ImportResolver]: matched imports
//! produce virtual source paths whose synthesized contents are served back
//! to the runtime from an in-memory map. Each pooled runtime owns its own
//! composite, so none of the caches in here need locks.

mod data;
mod glob;

pub use data::DataImporter;
pub use glob::{GlobImporter, GlobVerb};

use crate::sources::ManagedDataSource;
use jrsonnet_evaluator::{
    error::{ErrorKind, Result as JrResult},
    FileImportResolver, IStr, ImportResolver,
};
use jrsonnet_gcmodule::Trace;
use jrsonnet_parser::{SourcePath, SourceVirtual};
use log::trace;
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

/// One import strategy. `import` receives the directory of the importing
/// file, so relative patterns and paths resolve against the caller.
pub trait Import {
    /// Whether this importer handles the given path
    fn can_process(&self, path: &str) -> bool;

    /// Produce content for the path. Only called when `can_process` is true.
    fn import(&self, base: &Path, path: &str) -> anyhow::Result<Imported>;
}

/// Result of a handled import
#[derive(Debug)]
pub struct Imported {
    /// Source text handed to the runtime
    pub contents: String,
    /// Virtual name used by the runtime to deduplicate imports
    pub canonical: String,
    /// Directory against which imports nested in the contents resolve
    pub base: Option<PathBuf>,
}

/// Synthesized file contents, retained for the runtime's content requests
struct VirtualFile {
    contents: Vec<u8>,
    base: Option<PathBuf>,
}

/// Router over the ordered importer list plus the filesystem fallback
pub struct CompositeImporter {
    importers: Vec<Box<dyn Import>>,
    /// Unconditional tail of the chain. `None` only in tests exercising the
    /// no-importer error.
    files: Option<FileImportResolver>,
    virtuals: RefCell<HashMap<IStr, VirtualFile>>,
}

impl CompositeImporter {
    /// Standard importer stack: glob (both verbs), one data importer per
    /// source, then files
    pub fn new(
        lib_paths: Vec<PathBuf>,
        sources: &[Arc<dyn ManagedDataSource>],
    ) -> Self {
        let mut importers: Vec<Box<dyn Import>> = vec![
            Box::new(GlobImporter::new(GlobVerb::Import)),
            Box::new(GlobImporter::new(GlobVerb::ImportStr)),
        ];
        for source in sources {
            importers.push(Box::new(DataImporter::new(Arc::clone(source))));
        }
        Self {
            importers,
            files: Some(FileImportResolver::new(lib_paths)),
            virtuals: RefCell::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn without_files(importers: Vec<Box<dyn Import>>) -> Self {
        Self {
            importers,
            files: None,
            virtuals: RefCell::new(HashMap::new()),
        }
    }

    /// First importer claiming the path, if any
    fn first_match(&self, path: &str) -> Option<&dyn Import> {
        self.importers
            .iter()
            .map(Box::as_ref)
            .find(|importer| importer.can_process(path))
    }

    /// Directory of the importing file. Virtual files carry their own base
    /// (the directory of the file that originally triggered the synthesis);
    /// anything else falls back to the working directory.
    fn base_for(&self, from: &SourcePath) -> PathBuf {
        if let Some(virt) = from.downcast_ref::<SourceVirtual>() {
            if let Some(base) = self
                .virtuals
                .borrow()
                .get(&virt.0)
                .and_then(|file| file.base.clone())
            {
                return base;
            }
        } else if let Some(dir) =
            from.path().and_then(Path::parent).map(Path::to_owned)
        {
            return dir;
        }
        env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    fn import_virtual(
        &self,
        importer: &dyn Import,
        base: &Path,
        path: &str,
    ) -> JrResult<SourcePath> {
        match importer.import(base, path) {
            Ok(imported) => {
                let name: IStr = imported.canonical.as_str().into();
                trace!("Import {path} resolved to virtual file {name}");
                self.virtuals.borrow_mut().insert(
                    name.clone(),
                    VirtualFile {
                        contents: imported.contents.into_bytes(),
                        base: imported.base,
                    },
                );
                Ok(SourcePath::new(SourceVirtual(name)))
            }
            Err(error) => Err(ErrorKind::ImportCallbackError(format!(
                "{error:#}"
            ))
            .into()),
        }
    }
}

/// Shared handle passed to each runtime instance. The runtime wants an
/// owned resolver; the pooled VM wants to keep the caches across rebuilds.
#[derive(Trace)]
pub struct ResolverHandle(#[trace(skip)] pub Rc<CompositeImporter>);

impl ImportResolver for ResolverHandle {
    fn resolve_from(&self, from: &SourcePath, path: &str) -> JrResult<SourcePath> {
        let composite = &self.0;
        let base = composite.base_for(from);
        if let Some(importer) = composite.first_match(path) {
            return composite.import_virtual(importer, &base, path);
        }
        let Some(files) = &composite.files else {
            return Err(ErrorKind::ImportCallbackError(format!(
                "no importer for path {path}"
            ))
            .into());
        };
        // Imports nested inside a synthesized virtual file resolve against
        // the base directory recorded for it
        if from.downcast_ref::<SourceVirtual>().is_some()
            && !Path::new(path).is_absolute()
        {
            let absolute = base.join(path);
            if let Ok(resolved) = files.resolve(&absolute) {
                return Ok(resolved);
            }
        }
        files.resolve_from(from, path)
    }

    fn resolve(&self, path: &Path) -> JrResult<SourcePath> {
        let composite = &self.0;
        let Some(files) = &composite.files else {
            return Err(ErrorKind::ImportCallbackError(format!(
                "no importer for path {}",
                path.display()
            ))
            .into());
        };
        files.resolve(path)
    }

    fn load_file_contents(&self, resolved: &SourcePath) -> JrResult<Vec<u8>> {
        let composite = &self.0;
        if let Some(virt) = resolved.downcast_ref::<SourceVirtual>() {
            if let Some(file) = composite.virtuals.borrow().get(&virt.0) {
                return Ok(file.contents.clone());
            }
        }
        match &composite.files {
            Some(files) => files.load_file_contents(resolved),
            None => Err(ErrorKind::ResolvedFileNotFound(resolved.clone()).into()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
