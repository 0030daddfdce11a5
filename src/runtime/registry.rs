//! Routine registry
//!
//! Routines are registered once, before any dispatch, into an explicit
//! [`RoutineRegistry`] that the dispatcher owns. Definitions are immutable
//! after registration and looked up by their `skill.routine` designation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use super::error::{RegistryError, RegistryResult};
use super::machine::StateMachine;

/// `skill.routine` pair naming one routine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Designation {
    /// Owning skill
    pub skill: String,
    /// Routine name within the skill
    pub routine: String,
}

impl Designation {
    /// Build a designation from validated parts
    pub fn new(skill: &str, routine: &str) -> RegistryResult<Self> {
        if !valid_part(skill) || !valid_part(routine) {
            return Err(RegistryError::InvalidDesignation(format!("{skill}.{routine}")));
        }
        Ok(Self {
            skill: skill.to_string(),
            routine: routine.to_string(),
        })
    }
}

impl FromStr for Designation {
    type Err = RegistryError;

    fn from_str(s: &str) -> RegistryResult<Self> {
        match s.split_once('.') {
            Some((skill, routine)) if !routine.contains('.') => Self::new(skill, routine),
            _ => Err(RegistryError::InvalidDesignation(s.to_string())),
        }
    }
}

impl fmt::Display for Designation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.skill, self.routine)
    }
}

fn valid_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// Variant tag used for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutineKind {
    /// Template rendered and handed to the language model
    Instruction,
    /// Script evaluated by the replaying interpreter
    Program,
    /// Explicit init/step functions
    StateMachine,
}

/// Variant-specific payload of a routine
#[derive(Clone)]
pub enum RoutineBody {
    /// Instruction template with `{{ path }}` placeholders
    Instruction {
        /// Template text
        template: String,
    },
    /// Program source text
    Program {
        /// Script source
        source: String,
    },
    /// Init/step pair
    StateMachine(Arc<dyn StateMachine>),
}

impl RoutineBody {
    /// Variant tag
    pub fn kind(&self) -> RoutineKind {
        match self {
            RoutineBody::Instruction { .. } => RoutineKind::Instruction,
            RoutineBody::Program { .. } => RoutineKind::Program,
            RoutineBody::StateMachine(_) => RoutineKind::StateMachine,
        }
    }
}

impl fmt::Debug for RoutineBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineBody::Instruction { template } => f
                .debug_struct("Instruction")
                .field("template", template)
                .finish(),
            RoutineBody::Program { source } => {
                f.debug_struct("Program").field("source", source).finish()
            }
            RoutineBody::StateMachine(_) => f.write_str("StateMachine(..)"),
        }
    }
}

/// Immutable routine definition
#[derive(Debug, Clone)]
pub struct Routine {
    designation: Designation,
    /// Human description
    pub description: String,
    /// Variant payload
    pub body: RoutineBody,
}

impl Routine {
    /// Define a routine under a `skill.routine` designation
    pub fn new(designation: &str, body: RoutineBody) -> RegistryResult<Self> {
        Ok(Self {
            designation: designation.parse()?,
            description: String::new(),
            body,
        })
    }

    /// Templated-instruction routine
    pub fn instruction(designation: &str, template: impl Into<String>) -> RegistryResult<Self> {
        Self::new(
            designation,
            RoutineBody::Instruction {
                template: template.into(),
            },
        )
    }

    /// Programmatic routine
    pub fn program(designation: &str, source: impl Into<String>) -> RegistryResult<Self> {
        Self::new(
            designation,
            RoutineBody::Program {
                source: source.into(),
            },
        )
    }

    /// Explicit state-machine routine
    pub fn state_machine(
        designation: &str,
        machine: impl StateMachine + 'static,
    ) -> RegistryResult<Self> {
        Self::new(designation, RoutineBody::StateMachine(Arc::new(machine)))
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Parsed designation
    pub fn designation(&self) -> &Designation {
        &self.designation
    }

    /// Owning skill
    pub fn skill(&self) -> &str {
        &self.designation.skill
    }

    /// Routine name within the skill
    pub fn name(&self) -> &str {
        &self.designation.routine
    }

    /// Variant tag
    pub fn kind(&self) -> RoutineKind {
        self.body.kind()
    }
}

/// Registry of routine definitions keyed by designation
#[derive(Debug, Clone, Default)]
pub struct RoutineRegistry {
    routines: BTreeMap<String, Arc<Routine>>,
}

impl RoutineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a routine; designations are unique
    pub fn register(&mut self, routine: Routine) -> RegistryResult<()> {
        let key = routine.designation.to_string();
        if self.routines.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        tracing::debug!(routine = %key, kind = ?routine.kind(), "registered routine");
        self.routines.insert(key, Arc::new(routine));
        Ok(())
    }

    /// Look up a routine by designation
    pub fn resolve(&self, designation: &str) -> Option<Arc<Routine>> {
        self.routines.get(designation).cloned()
    }

    /// Whether a designation is registered
    pub fn contains(&self, designation: &str) -> bool {
        self.routines.contains_key(designation)
    }

    /// All registered designations in sorted order
    pub fn designations(&self) -> Vec<&str> {
        self.routines.keys().map(String::as_str).collect()
    }

    /// Distinct skill names in sorted order
    pub fn skills(&self) -> Vec<&str> {
        let mut skills: Vec<&str> = self.routines.values().map(|r| r.skill()).collect();
        skills.sort_unstable();
        skills.dedup();
        skills
    }

    /// Number of registered routines
    pub fn len(&self) -> usize {
        self.routines.len()
    }

    /// Whether no routine is registered
    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Build a registry from a JSON manifest file
    pub fn load_manifest(path: &Path) -> RegistryResult<Self> {
        let manifest = RoutineManifest::read(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut registry = Self::new();
        for entry in manifest.routines {
            registry.register(entry.into_routine(base, path)?)?;
        }
        Ok(registry)
    }
}

/// On-disk description of instruction and program routines.
///
/// ```json
/// { "routines": [
///     { "designation": "demo.greet", "kind": "instruction", "template": "Greet {{ name }}" },
///     { "designation": "demo.sum", "kind": "program", "file": "sum.enc" }
/// ] }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutineManifest {
    /// Routine entries
    #[serde(default)]
    pub routines: Vec<ManifestEntry>,
}

/// One manifest routine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `skill.routine` designation
    pub designation: String,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Variant payload
    #[serde(flatten)]
    pub body: ManifestBody,
}

/// Manifest payload; state machines are code and cannot be declared here
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ManifestBody {
    /// Instruction template
    Instruction {
        /// Template text
        template: String,
    },
    /// Program given inline or as a file relative to the manifest
    Program {
        /// Inline source
        #[serde(default)]
        source: Option<String>,
        /// Source file
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

impl RoutineManifest {
    /// Read and parse a manifest file
    pub fn read(path: &Path) -> RegistryResult<Self> {
        let invalid = |detail: String| RegistryError::Manifest {
            path: path.to_path_buf(),
            detail,
        };
        let data = std::fs::read(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))
    }
}

impl ManifestEntry {
    fn into_routine(self, base: &Path, manifest: &Path) -> RegistryResult<Routine> {
        let invalid = |detail: String| RegistryError::Manifest {
            path: manifest.to_path_buf(),
            detail,
        };
        let body = match self.body {
            ManifestBody::Instruction { template } => RoutineBody::Instruction { template },
            ManifestBody::Program {
                source: Some(source),
                file: None,
            } => RoutineBody::Program { source },
            ManifestBody::Program {
                source: None,
                file: Some(file),
            } => {
                let path = base.join(&file);
                let source = std::fs::read_to_string(&path)
                    .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
                RoutineBody::Program { source }
            }
            ManifestBody::Program { .. } => {
                return Err(invalid(format!(
                    "program routine '{}' needs exactly one of `source` or `file`",
                    self.designation
                )));
            }
        };
        Ok(Routine::new(&self.designation, body)?.with_description(self.description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_designations() {
        let designation: Designation = "web.search".parse().unwrap();
        assert_eq!(designation.skill, "web");
        assert_eq!(designation.routine, "search");
        assert_eq!(designation.to_string(), "web.search");

        for bad in ["web", ".search", "web.", "a.b.c", "we b.search", ""] {
            assert!(bad.parse::<Designation>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = RoutineRegistry::new();
        registry
            .register(Routine::program("math.sum", "return arg0 + arg1").unwrap())
            .unwrap();
        registry
            .register(Routine::instruction("chat.greet", "Hello {{ name }}").unwrap())
            .unwrap();

        let routine = registry.resolve("math.sum").unwrap();
        assert_eq!(routine.kind(), RoutineKind::Program);
        assert_eq!(routine.skill(), "math");
        assert_eq!(routine.name(), "sum");
        assert!(registry.resolve("math.product").is_none());
        assert_eq!(registry.designations(), vec!["chat.greet", "math.sum"]);
        assert_eq!(registry.skills(), vec!["chat", "math"]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = RoutineRegistry::new();
        registry
            .register(Routine::program("math.sum", "return 1").unwrap())
            .unwrap();
        assert!(matches!(
            registry.register(Routine::program("math.sum", "return 2").unwrap()),
            Err(RegistryError::Duplicate(name)) if name == "math.sum"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn loads_manifest_with_program_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("sum.enc"), "return arg0 + arg1").unwrap();
        let manifest = temp.path().join("routines.json");
        std::fs::write(
            &manifest,
            r#"{ "routines": [
                { "designation": "math.sum", "kind": "program", "file": "sum.enc",
                  "description": "adds" },
                { "designation": "chat.greet", "kind": "instruction", "template": "Hi {{ name }}" },
                { "designation": "math.one", "kind": "program", "source": "return 1" }
            ] }"#,
        )
        .unwrap();

        let registry = RoutineRegistry::load_manifest(&manifest).unwrap();
        assert_eq!(registry.len(), 3);
        let sum = registry.resolve("math.sum").unwrap();
        assert_eq!(sum.description, "adds");
        assert!(matches!(&sum.body, RoutineBody::Program { source } if source == "return arg0 + arg1"));
    }

    #[test]
    fn manifest_program_needs_one_source() {
        let temp = TempDir::new().unwrap();
        let manifest = temp.path().join("routines.json");
        std::fs::write(
            &manifest,
            r#"{ "routines": [ { "designation": "math.sum", "kind": "program" } ] }"#,
        )
        .unwrap();
        assert!(matches!(
            RoutineRegistry::load_manifest(&manifest),
            Err(RegistryError::Manifest { .. })
        ));
    }
}
