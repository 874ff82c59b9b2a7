use std::fs;
use std::io;
use std::path::Path;

use ahash::AHashSet;
use glob::Pattern;
use tracing::{debug, error};

/// Directory skip policy, evaluated once per sub-directory before it is queued.
///
/// A directory is skipped when its name is listed, starts with `.` or `_`,
/// its forward-slash path contains a listed fragment, or a glob matches it.
#[derive(Debug, Clone, Default)]
pub struct SkipRules {
    names: AHashSet<String>,
    partials: Vec<String>,
    patterns: Vec<Pattern>,
}

impl SkipRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the `.ignore` format: one rule per line, `#` starts a comment,
    /// lines containing `/` are path fragments, anything else a directory name.
    pub fn parse(text: &str) -> Self {
        let mut rules = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.contains('/') {
                rules.add_partial(line);
            } else {
                rules.add_name(line);
            }
        }
        rules
    }

    /// Loads rules from `path`. A missing file yields an empty rule set.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let rules = Self::parse(&text);
                debug!(
                    "Loaded {} names and {} path fragments from {}",
                    rules.names.len(),
                    rules.partials.len(),
                    path.display()
                );
                Ok(rules)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(err) => Err(err),
        }
    }

    pub fn add_name(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn add_partial(&mut self, fragment: &str) {
        if !self.partials.iter().any(|p| p == fragment) {
            self.partials.push(fragment.to_string());
        }
    }

    /// Adds glob patterns; invalid ones are logged and dropped.
    pub fn add_patterns<S: AsRef<str>>(&mut self, globs: &[S]) {
        for glob in globs {
            match Pattern::new(glob.as_ref()) {
                Ok(pattern) => self.patterns.push(pattern),
                Err(e) => error!("Invalid glob pattern '{}': {}", glob.as_ref(), e),
            }
        }
    }

    pub fn should_skip(&self, dir: &Path) -> bool {
        if let Some(name) = dir.file_name().map(|n| n.to_string_lossy()) {
            if self.names.contains(name.as_ref())
                || name.starts_with('.')
                || name.starts_with('_')
            {
                return true;
            }
        }
        if !self.partials.is_empty() {
            let posix = dir.to_string_lossy().replace('\\', "/");
            if self.partials.iter().any(|p| posix.contains(p.as_str())) {
                return true;
            }
        }
        self.patterns.iter().any(|pattern| pattern.matches_path(dir))
    }
}
