//! Tab discovery from compose documents.
//!
//! The compose file is treated as an untyped tree. Every string scalar that
//! sits under a `ports` key contributes its host-side port as a tab;
//! traversal preserves list order and keeps duplicates.

use serde_yaml::Value;

use super::DeploymentTab;
use crate::repo::AppTabSpec;

/// Walk the compose tree and collect a tab per host-side port.
pub fn discover_tabs(doc: &Value) -> Vec<DeploymentTab> {
    let mut tabs = Vec::new();
    walk(doc, "", &mut tabs);
    tabs
}

fn walk(value: &Value, parent: &str, tabs: &mut Vec<DeploymentTab>) {
    match value {
        Value::String(s) => {
            if parent == "ports" {
                let host_side = s.splitn(2, ':').next().unwrap_or("");
                if let Ok(port) = host_side.parse::<i64>() {
                    tabs.push(DeploymentTab::from_port(port));
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                walk(item, parent, tabs);
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map {
                let key = key.as_str().map(str::to_lowercase).unwrap_or_default();
                walk(item, &key, tabs);
            }
        }
        _ => {}
    }
}

/// Merge explicit app-tab metadata into the discovered tabs.
///
/// Each configured tab binds to the first discovered tab with the same port
/// that has not been bound yet, overriding name (when non-empty), path, and
/// hide. Unmatched configured tabs are appended.
pub fn merge_app_tabs(tabs: &mut Vec<DeploymentTab>, app_tabs: &[AppTabSpec]) {
    let mut bound = vec![false; tabs.len()];
    for spec in app_tabs {
        let slot = tabs
            .iter()
            .enumerate()
            .position(|(i, tab)| !bound[i] && tab.port == spec.port);
        match slot {
            Some(i) => {
                bound[i] = true;
                if !spec.name.is_empty() {
                    tabs[i].name = spec.name.clone();
                }
                tabs[i].path = spec.path.clone();
                tabs[i].hide = spec.hide;
            }
            None => {
                let name = if spec.name.is_empty() {
                    spec.port.to_string()
                } else {
                    spec.name.clone()
                };
                tabs.push(DeploymentTab {
                    port: spec.port,
                    url: String::new(),
                    hide: spec.hide,
                    name,
                    path: spec.path.clone(),
                });
            }
        }
    }
}
