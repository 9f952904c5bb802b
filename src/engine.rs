//! Analysis engine boundary.
//!
//! The gate treats the engine as an opaque collaborator: it receives the
//! guarded [`Namespace`] and a target name, and runs on the limiter's worker
//! thread. Engines that loop should poll [`Namespace::checkpoint`].

use anyhow::Result;
use serde::Serialize;

use crate::guardian::ModuleRef;
use crate::namespace::{FunctionInfo, Namespace};

pub trait AnalysisEngine: Send + Sync + 'static {
    type Output: Send + 'static;

    fn analyze(&self, namespace: &Namespace, target: &str) -> Result<Self::Output>;
}

/// Structural summary of an admitted namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Inventory {
    /// `None` when no target was requested or it does not exist.
    pub target: Option<FunctionInfo>,
    pub imports: Vec<ModuleRef>,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub names: Vec<String>,
}

/// Engine used by `gatecheck`: reports what the gate loaded.
#[derive(Clone, Copy, Debug, Default)]
pub struct InventoryEngine;

impl AnalysisEngine for InventoryEngine {
    type Output = Inventory;

    fn analyze(&self, namespace: &Namespace, target: &str) -> Result<Inventory> {
        namespace.checkpoint()?;
        let target = if target.is_empty() {
            None
        } else {
            let found = namespace.function(target).cloned();
            if found.is_none() {
                log::warn!("inventory: function '{}' not found", target);
            }
            found
        };
        Ok(Inventory {
            target,
            imports: namespace.imports().to_vec(),
            functions: namespace
                .functions()
                .map(|f| f.qualified_name.clone())
                .collect(),
            classes: namespace.classes().map(|c| c.name.clone()).collect(),
            names: namespace.names().map(str::to_string).collect(),
        })
    }
}
