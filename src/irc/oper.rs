//! Operator classes and permission resolution.
//!
//! Classes are ranked and may inherit from one parent; permissions resolve
//! as the union of the class, its ancestors, and the oper record's extra
//! flags. The token `*` grants everything. Inheritance cycles (and unknown
//! parents) are refused at load time.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

/// One operator class from the operator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OperClass {
    pub name: String,
    /// Higher number = higher authority.
    pub rank: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Parent class whose permissions are unioned in.
    #[serde(default)]
    pub inherits: Option<String>,
    /// Display symbol for this class (`*`, `&`, `~`, ...).
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub color: String,
}

/// The optional secondary operator configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct OperConfigFile {
    #[serde(default)]
    pub classes: Vec<OperClass>,
}

#[derive(Debug, thiserror::Error)]
pub enum OperPolicyError {
    #[error("duplicate operator class `{0}`")]
    DuplicateClass(String),
    #[error("operator class `{0}` inherits unknown class `{1}`")]
    UnknownParent(String, String),
    #[error("operator class inheritance cycle through `{0}`")]
    InheritanceCycle(String),
}

/// Resolved, read-only operator policy.
///
/// A disabled policy (no config file, or `enable: false`) treats every
/// oper as rank 1 with permissive defaults.
#[derive(Debug)]
pub struct OperPolicy {
    classes: HashMap<String, OperClass>,
    enabled: bool,
}

impl OperPolicy {
    /// The permissive fallback used when no operator configuration is
    /// loaded.
    pub fn disabled() -> Self {
        Self {
            classes: HashMap::new(),
            enabled: false,
        }
    }

    /// Build a policy from loaded classes, validating the inheritance
    /// graph.
    pub fn from_classes(classes: Vec<OperClass>) -> Result<Self, OperPolicyError> {
        let mut table: HashMap<String, OperClass> = HashMap::new();
        for class in classes {
            if table.contains_key(&class.name) {
                return Err(OperPolicyError::DuplicateClass(class.name));
            }
            table.insert(class.name.clone(), class);
        }

        // Walk every inheritance chain once; a chain either terminates,
        // names a missing parent, or revisits a class.
        for class in table.values() {
            let mut seen = HashSet::new();
            seen.insert(class.name.as_str());
            let mut current = class;
            while let Some(parent_name) = current.inherits.as_deref() {
                let parent = table.get(parent_name).ok_or_else(|| {
                    OperPolicyError::UnknownParent(
                        current.name.clone(),
                        parent_name.to_owned(),
                    )
                })?;
                if !seen.insert(parent.name.as_str()) {
                    return Err(OperPolicyError::InheritanceCycle(parent.name.clone()));
                }
                current = parent;
            }
        }

        Ok(Self {
            classes: table,
            enabled: true,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The rank of a class. Disabled policy: everyone is rank 1. Enabled
    /// policy: unknown or missing classes rank 0.
    pub fn rank(&self, class: Option<&str>) -> u32 {
        if !self.enabled {
            return 1;
        }
        class
            .and_then(|name| self.classes.get(name))
            .map(|c| c.rank)
            .unwrap_or(0)
    }

    /// Display symbol for a class; `*` when unknown.
    pub fn symbol(&self, class: Option<&str>) -> String {
        class
            .and_then(|name| self.classes.get(name))
            .map(|c| c.symbol.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "*".to_owned())
    }

    /// All permissions a class resolves to: its own, plus its ancestors'.
    pub fn class_permissions(&self, class: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut current = self.classes.get(class);
        while let Some(c) = current {
            result.extend(c.permissions.iter().cloned());
            // Cycles were rejected at load; this walk terminates.
            current = c.inherits.as_deref().and_then(|p| self.classes.get(p));
        }
        result
    }

    /// Whether an oper bound to `class` with per-record `extra_flags`
    /// holds `permission`. `*` anywhere grants all.
    pub fn has_permission(
        &self,
        class: Option<&str>,
        extra_flags: &[String],
        permission: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let grants = |p: &str| p == permission || p == "*";

        if extra_flags.iter().any(|p| grants(p)) {
            return true;
        }
        match class {
            Some(name) => self.class_permissions(name).iter().any(|p| grants(p)),
            None => false,
        }
    }

    /// Whether oper `a` may act on oper `b`: strictly higher rank, or the
    /// `override_rank` token.
    pub fn can_operate_on(
        &self,
        a_class: Option<&str>,
        a_flags: &[String],
        b_class: Option<&str>,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        self.rank(a_class) > self.rank(b_class)
            || self.has_permission(a_class, a_flags, "override_rank")
    }
}
