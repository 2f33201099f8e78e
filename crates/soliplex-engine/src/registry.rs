//! Registry of declarative workflow definitions and parameter sets.
//!
//! Entries are loaded from two configured directories at startup and on
//! explicit reload. Shipped (built-in) entries live in the directory root;
//! user uploads are written to a `user/` subdirectory so they survive
//! restarts. Built-ins are immutable and cannot be deleted through the
//! public surface. The raw text of every entry is preserved verbatim for
//! re-export.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use soliplex_core::{DefinitionError, HandlerRegistry, ParameterSet, WorkflowDefinition};

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Shipped with the deployment; immutable and undeletable
    Builtin,
    /// Uploaded through the public surface; freely modifiable
    User,
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The same id appeared twice, whether within one origin or across
    /// builtin and user origins
    #[error("duplicate definition id {id}: {first} and {second}")]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("{0} is built-in and cannot be modified or deleted")]
    BuiltinProtected(String),

    #[error("no definition with id {0}")]
    NotFound(String),

    /// A workflow references a handler key the process never registered.
    /// This fails loading, not execution.
    #[error("workflow {workflow} step {step} references unknown handler {handler}")]
    UnknownHandler {
        workflow: String,
        step: String,
        handler: String,
    },
}

struct Entry<T> {
    item: T,
    raw: String,
    origin: Origin,
    path: PathBuf,
}

/// Registry holding parsed definitions plus their verbatim text.
pub struct Registry {
    workflow_dir: PathBuf,
    param_dir: PathBuf,
    workflows: RwLock<HashMap<String, Entry<WorkflowDefinition>>>,
    params: RwLock<HashMap<String, Entry<ParameterSet>>>,
}

impl Registry {
    pub fn new(workflow_dir: impl Into<PathBuf>, param_dir: impl Into<PathBuf>) -> Self {
        Self {
            workflow_dir: workflow_dir.into(),
            param_dir: param_dir.into(),
            workflows: RwLock::new(HashMap::new()),
            params: RwLock::new(HashMap::new()),
        }
    }

    /// Load (or reload) every definition from disk.
    ///
    /// Workflow handler references are validated against the handler
    /// registry; an unknown key is a hard load error. On any error the
    /// previously loaded state is left untouched.
    pub fn load(&self, handlers: &HandlerRegistry) -> Result<(), RegistryError> {
        let mut workflows: HashMap<String, Entry<WorkflowDefinition>> = HashMap::new();
        for (path, raw, origin) in read_yaml_files(&self.workflow_dir)? {
            let def = WorkflowDefinition::from_yaml(&raw)?;
            validate_handlers(&def, handlers)?;
            insert_unique(&mut workflows, def.id.clone(), Entry { item: def, raw, origin, path })?;
        }

        let mut params: HashMap<String, Entry<ParameterSet>> = HashMap::new();
        for (path, raw, origin) in read_yaml_files(&self.param_dir)? {
            let set = ParameterSet::from_yaml(&raw)?;
            insert_unique(&mut params, set.id.clone(), Entry { item: set, raw, origin, path })?;
        }

        info!(
            workflows = workflows.len(),
            parameter_sets = params.len(),
            "loaded registry"
        );

        *self.workflows.write() = workflows;
        *self.params.write() = params;
        Ok(())
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut items: Vec<_> = self
            .workflows
            .read()
            .values()
            .map(|e| e.item.clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn get_workflow(&self, id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().get(id).map(|e| e.item.clone())
    }

    pub fn workflow_origin(&self, id: &str) -> Option<Origin> {
        self.workflows.read().get(id).map(|e| e.origin)
    }

    /// The verbatim stored text of a workflow, for re-export.
    pub fn export_workflow(&self, id: &str) -> Option<String> {
        self.workflows.read().get(id).map(|e| e.raw.clone())
    }

    /// Upload a new or replacement user workflow.
    ///
    /// Built-in ids cannot be shadowed. The text is persisted under the
    /// workflow directory's `user/` subdirectory so it survives reload.
    pub fn upload_workflow(
        &self,
        raw: &str,
        handlers: &HandlerRegistry,
    ) -> Result<WorkflowDefinition, RegistryError> {
        let def = WorkflowDefinition::from_yaml(raw)?;
        validate_handlers(&def, handlers)?;

        let mut workflows = self.workflows.write();
        if let Some(existing) = workflows.get(&def.id) {
            if existing.origin == Origin::Builtin {
                return Err(RegistryError::BuiltinProtected(def.id.clone()));
            }
        }

        let path = write_user_file(&self.workflow_dir, &def.id, raw)?;
        debug!(id = %def.id, path = %path.display(), "uploaded workflow");
        workflows.insert(
            def.id.clone(),
            Entry {
                item: def.clone(),
                raw: raw.to_string(),
                origin: Origin::User,
                path,
            },
        );
        Ok(def)
    }

    /// Delete a user-created workflow. Built-ins are protected.
    pub fn delete_workflow(&self, id: &str) -> Result<(), RegistryError> {
        let mut workflows = self.workflows.write();
        let entry = workflows
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if entry.origin == Origin::Builtin {
            return Err(RegistryError::BuiltinProtected(id.to_string()));
        }

        let path = entry.path.clone();
        std::fs::remove_file(&path).map_err(|source| RegistryError::Io { path, source })?;
        workflows.remove(id);
        debug!(id, "deleted workflow");
        Ok(())
    }

    // =========================================================================
    // Parameter sets
    // =========================================================================

    pub fn list_parameter_sets(&self) -> Vec<ParameterSet> {
        let mut items: Vec<_> = self.params.read().values().map(|e| e.item.clone()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn get_parameter_set(&self, id: &str) -> Option<ParameterSet> {
        self.params.read().get(id).map(|e| e.item.clone())
    }

    pub fn parameter_set_origin(&self, id: &str) -> Option<Origin> {
        self.params.read().get(id).map(|e| e.origin)
    }

    pub fn export_parameter_set(&self, id: &str) -> Option<String> {
        self.params.read().get(id).map(|e| e.raw.clone())
    }

    pub fn upload_parameter_set(&self, raw: &str) -> Result<ParameterSet, RegistryError> {
        let set = ParameterSet::from_yaml(raw)?;

        let mut params = self.params.write();
        if let Some(existing) = params.get(&set.id) {
            if existing.origin == Origin::Builtin {
                return Err(RegistryError::BuiltinProtected(set.id.clone()));
            }
        }

        let path = write_user_file(&self.param_dir, &set.id, raw)?;
        debug!(id = %set.id, path = %path.display(), "uploaded parameter set");
        params.insert(
            set.id.clone(),
            Entry {
                item: set.clone(),
                raw: raw.to_string(),
                origin: Origin::User,
                path,
            },
        );
        Ok(set)
    }

    pub fn delete_parameter_set(&self, id: &str) -> Result<(), RegistryError> {
        let mut params = self.params.write();
        let entry = params
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if entry.origin == Origin::Builtin {
            return Err(RegistryError::BuiltinProtected(id.to_string()));
        }

        let path = entry.path.clone();
        std::fs::remove_file(&path).map_err(|source| RegistryError::Io { path, source })?;
        params.remove(id);
        debug!(id, "deleted parameter set");
        Ok(())
    }
}

fn validate_handlers(
    def: &WorkflowDefinition,
    handlers: &HandlerRegistry,
) -> Result<(), RegistryError> {
    for step in &def.steps {
        if !handlers.contains(&step.handler) {
            return Err(RegistryError::UnknownHandler {
                workflow: def.id.clone(),
                step: step.name.clone(),
                handler: step.handler.clone(),
            });
        }
    }
    Ok(())
}

fn insert_unique<T>(
    map: &mut HashMap<String, Entry<T>>,
    id: String,
    entry: Entry<T>,
) -> Result<(), RegistryError> {
    if let Some(first) = map.get(&id) {
        return Err(RegistryError::DuplicateId {
            id,
            first: first.path.clone(),
            second: entry.path,
        });
    }
    map.insert(id, entry);
    Ok(())
}

/// Read every .yaml/.yml file in the directory root (builtin) and its
/// `user/` subdirectory (user origin). A missing directory is an empty
/// registry, not an error.
fn read_yaml_files(dir: &Path) -> Result<Vec<(PathBuf, String, Origin)>, RegistryError> {
    let mut out = Vec::new();
    collect_yaml(dir, Origin::Builtin, &mut out)?;
    collect_yaml(&dir.join("user"), Origin::User, &mut out)?;
    // Deterministic load order so duplicate-id errors are stable
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

fn collect_yaml(
    dir: &Path,
    origin: Origin,
    out: &mut Vec<(PathBuf, String, Origin)>,
) -> Result<(), RegistryError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(RegistryError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries {
        let entry = entry.map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !path.is_file() || !is_yaml {
            continue;
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        out.push((path, raw, origin));
    }
    Ok(())
}

fn write_user_file(dir: &Path, id: &str, raw: &str) -> Result<PathBuf, RegistryError> {
    let user_dir = dir.join("user");
    std::fs::create_dir_all(&user_dir).map_err(|source| RegistryError::Io {
        path: user_dir.clone(),
        source,
    })?;

    let path = user_dir.join(format!("{id}.yaml"));
    std::fs::write(&path, raw).map_err(|source| RegistryError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
