//! Release configuration: packages, phase workflows, templates.
//!
//! Loaded once at startup from YAML. Templates in refs and inputs
//! substitute `{tag}`, `{release_type}` and `{artifact_url[name]}`;
//! unknown placeholders are a configuration error surfaced with the
//! offending key.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{ArtifactRef, ReleaseType};

/// Default build timeout when the config does not set one.
pub const DEFAULT_BUILD_TIMEOUT_MINUTES: u64 = 45;

/// Default publish timeout when the config does not set one.
pub const DEFAULT_PUBLISH_TIMEOUT_MINUTES: u64 = 10;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)(?:\[([^\]\{\}]+)\])?\}").unwrap());

/// Root configuration model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Config schema version.
    pub version: u32,

    /// Downstream packages in declared order; the order fixes the tick
    /// order of the release tree.
    pub packages: Vec<PackageConfig>,

    /// Exact-tag overrides applied after tag derivation.
    #[serde(default)]
    pub release_type_overrides: BTreeMap<String, ReleaseType>,
}

/// Configuration for one downstream package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package name, unique within the config.
    pub name: String,

    /// Repository the package's workflows live in (`owner/repo`).
    pub repo: String,

    /// Build stage configuration.
    pub build: PhaseConfig,

    /// Publish stage configuration.
    pub publish: PhaseConfig,

    /// Packages whose build must succeed before this package starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Configuration for one workflow phase of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Workflow file to dispatch (e.g. `build.yml`).
    pub workflow: String,

    /// Template for the ref to dispatch against.
    #[serde(default = "default_ref_template")]
    pub ref_template: String,

    /// Templates for the workflow inputs.
    #[serde(default)]
    pub inputs_template: BTreeMap<String, String>,

    /// Overall cap for the phase, minutes. Defaults depend on the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,

    /// Artifact names to collect after a successful run; empty keeps all.
    #[serde(default)]
    pub artifacts_whitelist: Vec<String>,
}

fn default_ref_template() -> String {
    "main".to_string()
}

impl PhaseConfig {
    /// Effective timeout with the per-phase default applied.
    pub fn timeout_minutes_or(&self, default: u64) -> u64 {
        self.timeout_minutes.unwrap_or(default)
    }
}

impl ReleaseConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` when the file is missing, the YAML is
    /// invalid, or validation fails.
    pub fn from_yaml(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: ReleaseConfig = serde_yaml::from_str(&content).map_err(|e| {
            CoreError::Config(format!("invalid YAML in {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Looks up a package by name.
    pub fn package(&self, name: &str) -> Option<&PackageConfig> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Checks structural soundness: unique package names, known and
    /// acyclic `depends_on` edges.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` naming the offending package.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = BTreeSet::new();
        for package in &self.packages {
            if !seen.insert(package.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate package '{}'",
                    package.name
                )));
            }
        }

        for package in &self.packages {
            for dep in &package.depends_on {
                if dep == &package.name {
                    return Err(CoreError::Config(format!(
                        "package '{}' depends on itself",
                        package.name
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(CoreError::Config(format!(
                        "package '{}' depends on unknown package '{dep}'",
                        package.name
                    )));
                }
            }
        }

        for package in &self.packages {
            let mut trail = Vec::new();
            self.check_cycle(&package.name, &mut trail)?;
        }
        Ok(())
    }

    fn check_cycle<'a>(&'a self, name: &'a str, trail: &mut Vec<&'a str>) -> Result<(), CoreError> {
        if trail.contains(&name) {
            return Err(CoreError::Config(format!(
                "dependency cycle involving package '{name}'"
            )));
        }
        trail.push(name);
        if let Some(package) = self.package(name) {
            for dep in &package.depends_on {
                self.check_cycle(dep, trail)?;
            }
        }
        trail.pop();
        Ok(())
    }
}

/// Values available to template substitution.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    /// The release tag.
    pub tag: &'a str,
    /// The resolved release type.
    pub release_type: ReleaseType,
    /// Artifacts collected so far for the package, for `{artifact_url[..]}`.
    pub artifacts: &'a BTreeMap<String, ArtifactRef>,
}

/// Substitutes the supported placeholders in `template`.
///
/// Supported: `{tag}`, `{release_type}`, `{artifact_url[name]}`. Text that
/// does not match the placeholder shape is passed through unchanged.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
///
/// use slipway_core::config::{TemplateContext, render_template};
/// use slipway_core::model::ReleaseType;
///
/// let artifacts = BTreeMap::new();
/// let ctx = TemplateContext {
///     tag: "8.2.0",
///     release_type: ReleaseType::Ga,
///     artifacts: &artifacts,
/// };
/// let rendered = render_template("release/{tag} ({release_type})", &ctx).unwrap();
/// assert_eq!(rendered, "release/8.2.0 (ga)");
/// ```
///
/// # Errors
///
/// Returns `CoreError::Config` for an unknown placeholder key or a missing
/// artifact name.
pub fn render_template(template: &str, ctx: &TemplateContext<'_>) -> Result<String, CoreError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let key = &caps[1];
        let arg = caps.get(2).map(|m| m.as_str());
        match (key, arg) {
            ("tag", None) => out.push_str(ctx.tag),
            ("release_type", None) => out.push_str(ctx.release_type.as_str()),
            ("artifact_url", Some(name)) => {
                let artifact = ctx.artifacts.get(name).ok_or_else(|| {
                    CoreError::Config(format!(
                        "template references artifact '{name}' which was not collected"
                    ))
                })?;
                out.push_str(&artifact.download_url);
            }
            _ => {
                return Err(CoreError::Config(format!(
                    "unknown template placeholder '{}'",
                    whole.as_str()
                )));
            }
        }
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Renders every value of an inputs template map.
///
/// # Errors
///
/// Returns `CoreError::Config` naming the first offending input key.
pub fn render_inputs(
    templates: &BTreeMap<String, String>,
    ctx: &TemplateContext<'_>,
) -> Result<BTreeMap<String, String>, CoreError> {
    let mut rendered = BTreeMap::new();
    for (key, template) in templates {
        let value = render_template(template, ctx)
            .map_err(|e| CoreError::Config(format!("input '{key}': {e}")))?;
        rendered.insert(key.clone(), value);
    }
    Ok(rendered)
}
