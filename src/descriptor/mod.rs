//! Module descriptor processing.
//!
//! A module descriptor is the YAML file deployed for one service. Before it
//! can be handed to the platform CLI it goes through [`ModuleDescriptor::process`]:
//!
//! 1. deprecated top-level keys (`application`, `version`, `module`) are
//!    stripped and `service` is set to the module's name;
//! 2. the non-standard `luci_gae_vars` section is popped and interpreted as
//!    per-target variable declarations:
//!
//!    ```yaml
//!    luci_gae_vars:
//!      example-app-dev:
//!        AUTH_SERVICE_HOST: auth-service-dev.appspot.com
//!        WORKERS: 2
//!      example-app-prod:
//!        AUTH_SERVICE_HOST: auth-service-prod.appspot.com
//!        WORKERS: 8
//!    ```
//!
//! 3. every `${NAME}` placeholder inside string values (never keys) is
//!    substituted from caller overrides first, then from the declarations
//!    of the selected target.
//!
//! Variables are typed. The declared values of a name across all targets
//! must agree on integer-vs-string, and an override for an integer-typed
//! variable must itself parse as an `i32`. A string that consists of
//! exactly one placeholder keeps the variable's type in the output (an
//! integer variable yields an integer scalar); a placeholder embedded in
//! longer text coerces the value to its string form.
//!
//! Processing returns the set of variable names actually consumed so the
//! CLI can warn about `--var` flags nothing referenced.

use anyhow::{Context, Result};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::core::DeployError;

/// Top-level key holding the per-target variable declarations.
pub const VARS_KEY: &str = "luci_gae_vars";

/// Top-level keys the platform CLI no longer understands.
const LEGACY_KEYS: [&str; 3] = ["application", "version", "module"];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").expect("static regex"));
static SOLE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{(\w+)\}$").expect("static regex"));

/// A typed variable value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarValue {
    /// 32-bit signed integer
    Int(i32),
    /// Arbitrary string
    Str(String),
}

impl VarValue {
    fn kind(&self) -> VarKind {
        match self {
            Self::Int(_) => VarKind::Int,
            Self::Str(_) => VarKind::Str,
        }
    }

    /// String form used when the placeholder is embedded in longer text.
    fn coerce_to_string(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Str(s) => s.clone(),
        }
    }

    /// YAML scalar used when the placeholder stands alone.
    fn into_yaml(self) -> Value {
        match self {
            Self::Int(i) => Value::Number(i.into()),
            Self::Str(s) => Value::String(s),
        }
    }
}

/// The unified type of a variable across all targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// Declared (somewhere) as an integer
    Int,
    /// Declared as a string, or not declared at all
    Str,
}

/// A parsed module descriptor.
///
/// `name` and `runtime` are extracted up front; the rest of the document is
/// held as a YAML tree and only reshaped by [`process`](Self::process).
#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    /// The module (aka service) name: `service` key, else the legacy
    /// `module` key, else `"default"`.
    pub name: String,
    /// Value of the `runtime` key, empty if absent.
    pub runtime: String,
    doc: Mapping,
}

impl ModuleDescriptor {
    /// Load a descriptor from a YAML file.
    pub fn read_yaml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(DeployError::IoError)
            .with_context(|| format!("failed to read module YAML {}", path.display()))?;
        let value: Value =
            serde_yaml::from_str(&raw).map_err(|err| DeployError::DescriptorParseError {
                file: path.display().to_string(),
                reason: err.to_string(),
            })?;
        Self::from_value(value).with_context(|| format!("in module YAML {}", path.display()))
    }

    /// Build a descriptor from an already-parsed YAML tree.
    pub fn from_value(value: Value) -> Result<Self> {
        let doc = match value {
            Value::Mapping(doc) => doc,
            _ => {
                return Err(DeployError::BadDecl {
                    message: "module YAML must be a mapping".to_string(),
                }
                .into());
            }
        };

        let name = match string_key(&doc, "service")? {
            Some(name) => name,
            None => string_key(&doc, "module")?.unwrap_or_else(|| "default".to_string()),
        };
        let runtime = string_key(&doc, "runtime")?.unwrap_or_default();

        Ok(Self { name, runtime, doc })
    }

    /// The current document tree.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Mapping(self.doc.clone())
    }

    /// Serialize the (typically processed) document back to YAML text.
    pub fn dump_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.doc).context("failed to serialize module YAML")
    }

    /// Rewrite the descriptor for deployment to `target`.
    ///
    /// `target` selects which section of `luci_gae_vars` supplies baseline
    /// values; `overrides` (from `--var` flags) win over the baseline.
    /// Returns the names of all variables consumed during substitution.
    ///
    /// Overrides for undeclared variables are allowed and treated as
    /// string-typed, so a descriptor without a `luci_gae_vars` section can
    /// still use placeholders fed entirely from overrides.
    ///
    /// # Errors
    ///
    /// - [`DeployError::BadDecl`] - `luci_gae_vars` is not a mapping of
    ///   mappings, or a declared value is neither integer nor string
    /// - [`DeployError::AmbiguousType`] - a variable declared integer in
    ///   one target and string in another
    /// - [`DeployError::BadOverride`] - an override for an integer-typed
    ///   variable does not parse as `i32` (checked before any substitution)
    /// - [`DeployError::UndefinedVariable`] - a placeholder with neither an
    ///   override nor a baseline value
    pub fn process(
        &mut self,
        target: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<BTreeSet<String>> {
        for key in LEGACY_KEYS {
            self.doc.remove(key);
        }
        self.doc.insert(
            Value::String("service".to_string()),
            Value::String(self.name.clone()),
        );

        let declarations = match self.doc.remove(VARS_KEY) {
            Some(raw) => parse_declarations(raw)?,
            None => BTreeMap::new(),
        };

        let kinds = unify_kinds(&declarations)?;
        validate_overrides(&kinds, overrides)?;

        let baseline = declarations.get(target).cloned().unwrap_or_default();
        let mut resolver = Resolver {
            kinds,
            overrides,
            baseline,
            consumed: BTreeSet::new(),
        };

        let rendered = render(&Value::Mapping(std::mem::take(&mut self.doc)), &mut resolver)?;
        self.doc = match rendered {
            Value::Mapping(doc) => doc,
            _ => unreachable!("rendering preserves the node shape"),
        };
        Ok(resolver.consumed)
    }
}

/// Read an optional top-level string key, rejecting non-string values.
fn string_key(doc: &Mapping, key: &str) -> Result<Option<String>> {
    match doc.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(DeployError::BadDecl {
            message: format!("key {key:?} must be a string, got {}", type_name(other)),
        }
        .into()),
    }
}

/// Parse `luci_gae_vars` into target -> name -> typed value.
fn parse_declarations(raw: Value) -> Result<BTreeMap<String, BTreeMap<String, VarValue>>> {
    let targets = match raw {
        Value::Mapping(m) => m,
        other => {
            return Err(DeployError::BadDecl {
                message: format!("{VARS_KEY} must be a mapping, got {}", type_name(&other)),
            }
            .into());
        }
    };

    let mut out = BTreeMap::new();
    for (target, vars) in targets {
        let target = match target {
            Value::String(s) => s,
            other => {
                return Err(DeployError::BadDecl {
                    message: format!(
                        "{VARS_KEY} target identifiers must be strings, got {}",
                        type_name(&other)
                    ),
                }
                .into());
            }
        };
        let vars = match vars {
            Value::Mapping(m) => m,
            other => {
                return Err(DeployError::BadDecl {
                    message: format!(
                        "{VARS_KEY} section for target {target:?} must be a mapping, got {}",
                        type_name(&other)
                    ),
                }
                .into());
            }
        };

        let mut decls = BTreeMap::new();
        for (name, value) in vars {
            let name = match name {
                Value::String(s) => s,
                other => {
                    return Err(DeployError::BadDecl {
                        message: format!(
                            "variable names in {VARS_KEY} must be strings, got {}",
                            type_name(&other)
                        ),
                    }
                    .into());
                }
            };
            decls.insert(name.clone(), declared_value(&target, &name, value)?);
        }
        out.insert(target, decls);
    }
    Ok(out)
}

/// A declared default must be a string or an integer that fits in `i32`.
fn declared_value(target: &str, name: &str, value: Value) -> Result<VarValue> {
    match value {
        Value::String(s) => Ok(VarValue::Str(s)),
        Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(VarValue::Int(i)),
            None => Err(DeployError::BadDecl {
                message: format!(
                    "variable {name:?} in target {target:?} must fit in a 32-bit integer, got {n}"
                ),
            }
            .into()),
        },
        other => Err(DeployError::BadDecl {
            message: format!(
                "variable {name:?} in target {target:?} has unsupported type {}",
                type_name(&other)
            ),
        }
        .into()),
    }
}

/// Compute a single type per variable name across all targets.
fn unify_kinds(
    declarations: &BTreeMap<String, BTreeMap<String, VarValue>>,
) -> Result<BTreeMap<String, VarKind>> {
    let mut kinds = BTreeMap::new();
    for decls in declarations.values() {
        for (name, value) in decls {
            let kind = value.kind();
            match kinds.insert(name.clone(), kind) {
                Some(prev) if prev != kind => {
                    return Err(DeployError::AmbiguousType { name: name.clone() }.into());
                }
                _ => {}
            }
        }
    }
    Ok(kinds)
}

/// Overrides for integer-typed variables must parse before any
/// substitution happens.
fn validate_overrides(
    kinds: &BTreeMap<String, VarKind>,
    overrides: &BTreeMap<String, String>,
) -> Result<()> {
    for (name, value) in overrides {
        if kinds.get(name) == Some(&VarKind::Int) && value.parse::<i32>().is_err() {
            return Err(DeployError::BadOverride {
                name: name.clone(),
                value: value.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Resolves variable names during rendering and records what was used.
struct Resolver<'a> {
    kinds: BTreeMap<String, VarKind>,
    overrides: &'a BTreeMap<String, String>,
    baseline: BTreeMap<String, VarValue>,
    consumed: BTreeSet<String>,
}

impl Resolver<'_> {
    fn resolve(&mut self, name: &str) -> Result<VarValue> {
        self.consumed.insert(name.to_string());

        if let Some(value) = self.overrides.get(name) {
            // Undeclared names default to string-typed.
            return match self.kinds.get(name).copied().unwrap_or(VarKind::Str) {
                VarKind::Str => Ok(VarValue::Str(value.clone())),
                VarKind::Int => value.parse::<i32>().map(VarValue::Int).map_err(|_| {
                    DeployError::BadOverride {
                        name: name.to_string(),
                        value: value.clone(),
                    }
                    .into()
                }),
            };
        }

        if let Some(value) = self.baseline.get(name) {
            return Ok(value.clone());
        }

        Err(DeployError::UndefinedVariable {
            name: name.to_string(),
        }
        .into())
    }
}

/// Walk the document, substituting placeholders in string scalars.
///
/// Mapping keys and non-string scalars pass through untouched. Nodes are
/// rebuilt as partially-modified copies.
fn render(value: &Value, resolver: &mut Resolver<'_>) -> Result<Value> {
    match value {
        Value::String(s) => render_string(s, resolver),
        Value::Mapping(m) => {
            let mut out = Mapping::with_capacity(m.len());
            for (key, val) in m {
                out.insert(key.clone(), render(val, resolver)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                out.push(render(item, resolver)?);
            }
            Ok(Value::Sequence(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, resolver: &mut Resolver<'_>) -> Result<Value> {
    // A sole placeholder keeps the variable's type; an embedded one forces
    // string coercion.
    if let Some(caps) = SOLE_PLACEHOLDER.captures(s) {
        return Ok(resolver.resolve(&caps[1])?.into_yaml());
    }

    let mut out = String::new();
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let site = caps.get(0).expect("capture 0 always present");
        out.push_str(&s[last..site.start()]);
        out.push_str(&resolver.resolve(&caps[1])?.coerce_to_string());
        last = site.end();
    }
    if last == 0 {
        return Ok(Value::String(s.to_string()));
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
