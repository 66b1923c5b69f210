//! Manifest templates
//!
//! A [`TemplateProvider`] turns a template name plus string parameters into a
//! structured manifest. [`FileTemplateProvider`] reads a directory of Jinja
//! templates once and renders them with `minijinja`: blocks are trimmed the
//! way the YAML templates expect, and any undefined value is an error.

use crate::error::{OperatorError, Result};
use minijinja::{Environment, UndefinedBehavior};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TEMPLATE_EXTENSIONS: &[&str] = &["yaml", "yml", "j2"];

/// Global functions templates may call without a parameter of that name
const BUILTIN_FUNCTIONS: &[&str] = &["range", "dict", "debug"];

/// Renders named templates into manifests
pub trait TemplateProvider: Send + Sync {
    fn render(&self, template: &str, parameters: &BTreeMap<String, String>)
        -> Result<serde_json::Value>;
}

/// Template provider backed by a directory of files
#[derive(Debug, Clone)]
pub struct FileTemplateProvider {
    dir: PathBuf,
    env: Environment<'static>,
    names: BTreeSet<String>,
}

fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env
}

fn template_error(template: &str, err: minijinja::Error) -> OperatorError {
    OperatorError::Template(format!("{}: {:#}", template, err))
}

impl FileTemplateProvider {
    /// Load every template in `dir`. The template name is the file stem, so
    /// `server-deployment.yaml` is rendered as `server-deployment`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut templates = HashMap::new();

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            OperatorError::Template(format!("cannot read template dir {}: {}", dir.display(), e))
        })?;
        for entry in entries {
            let path = entry?.path();
            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e));
            if !path.is_file() || !is_template {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path)?;
            debug!(template = %name, path = %path.display(), "Loaded template");
            templates.insert(name.to_string(), body);
        }

        let mut provider = Self::from_templates(templates)?;
        info!(dir = %dir.display(), count = provider.names.len(), "Loaded templates");
        provider.dir = dir;
        Ok(provider)
    }

    /// Build a provider from in-memory templates; syntax errors fail here
    pub fn from_templates(templates: HashMap<String, String>) -> Result<Self> {
        let mut env = template_env();
        let mut names = BTreeSet::new();
        for (name, body) in templates {
            env.add_template_owned(name.clone(), body)
                .map_err(|e| template_error(&name, e))?;
            names.insert(name);
        }
        Ok(Self {
            dir: PathBuf::new(),
            env,
            names,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Template names in sorted order
    pub fn template_names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }
}

impl TemplateProvider for FileTemplateProvider {
    fn render(
        &self,
        template: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value> {
        let compiled = self.env.get_template(template).map_err(|_| {
            OperatorError::Template(format!(
                "unknown template '{}' in {}",
                template,
                self.dir.display()
            ))
        })?;

        // `namespace` is also a builtin function, so strict mode alone would
        // not catch a missing namespace parameter
        let missing: BTreeSet<String> = compiled
            .undeclared_variables(false)
            .into_iter()
            .filter(|key| !parameters.contains_key(key))
            .filter(|key| !BUILTIN_FUNCTIONS.contains(&key.as_str()))
            .collect();
        if !missing.is_empty() {
            let keys: Vec<&str> = missing.iter().map(String::as_str).collect();
            return Err(OperatorError::Template(format!(
                "{}: missing parameters: {}",
                template,
                keys.join(", ")
            )));
        }

        let rendered = compiled
            .render(parameters)
            .map_err(|e| template_error(template, e))?;
        let manifest: serde_json::Value = serde_yaml::from_str(&rendered)?;
        if !manifest.is_object() {
            return Err(OperatorError::Template(format!(
                "template '{}' did not render to a mapping",
                template
            )));
        }
        Ok(manifest)
    }
}
