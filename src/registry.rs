//! Grammar registry
//!
//! Holds raw grammars by scope name and compiles them on first use. Grammars
//! resolve `source.x` includes and `injectTo` injections through the registry,
//! and share the registry's theme.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, GrammarLoadError, Result};
use crate::grammar::{Grammar, GrammarConfiguration, GrammarRepository, RawGrammar};
use crate::theme::Theme;

#[derive(Default)]
pub struct Registry {
    raw: RwLock<FxHashMap<String, Arc<RawGrammar>>>,
    /// Target scope to the scopes injecting into it
    injectors: RwLock<FxHashMap<String, Vec<String>>>,
    configurations: RwLock<FxHashMap<String, GrammarConfiguration>>,
    compiled: Mutex<FxHashMap<String, Arc<Grammar>>>,
    theme: RwLock<Option<Arc<Theme>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a grammar, replacing any grammar with the same scope name.
    /// Returns the scope name.
    pub fn add_grammar(&self, raw: RawGrammar) -> std::result::Result<String, GrammarLoadError> {
        raw.validate()?;
        let scope = raw.scope_name().to_string();
        {
            let mut injectors = self.injectors.write();
            for list in injectors.values_mut() {
                list.retain(|s| s != &scope);
            }
            for target in &raw.inject_to {
                injectors.entry(target.clone()).or_default().push(scope.clone());
            }
        }
        self.raw.write().insert(scope.clone(), Arc::new(raw));
        // Includes and injections of already compiled grammars may resolve differently now
        self.compiled.lock().clear();
        debug!(scope = %scope, "grammar registered");
        Ok(scope)
    }

    pub fn load_grammar_file(&self, path: &Path) -> std::result::Result<String, GrammarLoadError> {
        self.add_grammar(RawGrammar::from_path(path)?)
    }

    /// Register every `.json` grammar in `dir`. Files that fail to load are
    /// logged and skipped.
    pub fn load_grammar_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut scopes = Vec::new();
        for path in paths {
            match self.load_grammar_file(&path) {
                Ok(scope) => scopes.push(scope),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping grammar"),
            }
        }
        info!(dir = %dir.display(), grammars = scopes.len(), "grammar directory loaded");
        Ok(scopes)
    }

    /// Settings used the next time the grammar for `scope` is compiled
    pub fn set_configuration(&self, scope: &str, configuration: GrammarConfiguration) {
        self.configurations.write().insert(scope.to_string(), configuration);
        self.compiled.lock().remove(scope);
    }

    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.raw.read().keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Compiled grammar for `scope`
    pub fn grammar(&self, scope: &str) -> Result<Arc<Grammar>> {
        if let Some(grammar) = self.compiled.lock().get(scope) {
            return Ok(Arc::clone(grammar));
        }
        let raw = self
            .lookup(scope)
            .ok_or_else(|| Error::UnknownScope(scope.to_string()))?;
        let configuration = self.configurations.read().get(scope).cloned().unwrap_or_default();
        let grammar = Grammar::new(raw, Some(self), &configuration)?;
        grammar.set_theme(self.theme());

        let mut compiled = self.compiled.lock();
        let grammar = compiled.entry(scope.to_string()).or_insert_with(|| Arc::new(grammar));
        Ok(Arc::clone(grammar))
    }

    /// Scope of the grammar claiming `path` by extension or file name
    pub fn scope_for_path(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let extension = path.extension().and_then(|ext| ext.to_str());
        let raw = self.raw.read();
        let mut scopes: Vec<&String> = raw.keys().collect();
        scopes.sort();
        scopes
            .into_iter()
            .find(|scope| {
                raw[*scope]
                    .file_types
                    .iter()
                    .any(|ft| Some(ft.as_str()) == extension || ft == file_name)
            })
            .cloned()
    }

    /// Scope of the grammar whose `firstLineMatch` accepts `line`
    pub fn scope_for_first_line(&self, line: &str) -> Option<String> {
        self.scopes()
            .into_iter()
            .filter(|scope| self.raw.read().get(scope).is_some_and(|raw| raw.first_line_match.is_some()))
            .find(|scope| self.grammar(scope).is_ok_and(|g| g.matches_first_line(line)))
    }

    /// Theme for every grammar from this registry, compiled or not
    pub fn set_theme(&self, theme: Option<Arc<Theme>>) {
        *self.theme.write() = theme.clone();
        for grammar in self.compiled.lock().values() {
            grammar.set_theme(theme.clone());
        }
    }

    pub fn theme(&self) -> Option<Arc<Theme>> {
        self.theme.read().clone()
    }
}

impl GrammarRepository for Registry {
    fn lookup(&self, scope_name: &str) -> Option<Arc<RawGrammar>> {
        self.raw.read().get(scope_name).cloned()
    }

    fn injections(&self, scope_name: &str) -> Vec<String> {
        self.injectors.read().get(scope_name).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("scopes", &self.scopes()).finish_non_exhaustive()
    }
}
