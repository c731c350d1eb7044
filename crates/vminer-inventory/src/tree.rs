//! Hierarchy flattening
//!
//! Snapshot trees and folder hierarchies are stored as flat records that point
//! at each other by id.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use vminer_session::{RemoteObject, SnapshotTree};

use crate::types::ResourceRecord;

/// Name of the implicit inventory root left out of folder paths
const ROOT_FOLDER: &str = "Datacenters";

/// Flatten the snapshot trees of one VM
///
/// Ids become `"{vm}/{snapshot}"`, every snapshot points at its VM through
/// `parent_id`, and at its parent snapshot through the `parent_snapshot`
/// attribute (null for roots). `depth` is 0 for roots.
#[must_use]
pub fn flatten_snapshots(vm_id: &str, roots: Vec<SnapshotTree>) -> Vec<RemoteObject> {
    let mut flat = Vec::new();
    for root in roots {
        walk_snapshot(vm_id, root, None, 0, &mut flat);
    }
    flat
}

fn walk_snapshot(
    vm_id: &str,
    node: SnapshotTree,
    parent: Option<&str>,
    depth: u64,
    out: &mut Vec<RemoteObject>,
) {
    let SnapshotTree {
        mut snapshot,
        children,
    } = node;

    let id = format!("{vm_id}/{}", snapshot.id);
    snapshot.properties.insert(
        "parent_snapshot".to_string(),
        parent.map_or(Value::Null, |p| Value::String(p.to_string())),
    );
    snapshot
        .properties
        .insert("depth".to_string(), Value::from(depth));
    snapshot.id.clone_from(&id);
    snapshot.parent_id = Some(vm_id.to_string());
    out.push(snapshot);

    for child in children {
        walk_snapshot(vm_id, child, Some(&id), depth + 1, out);
    }
}

/// Set the `path` attribute of every folder record
///
/// The path joins folder names from the top down with `/`, walking
/// `parent_id` links between the given folders. The walk stops at a parent
/// that is not a known folder and leaves out the `Datacenters` root. A cycle
/// in the parent links ends the walk at the first repeated folder.
pub fn assign_folder_paths(folders: &mut [ResourceRecord]) {
    let index: HashMap<String, (String, Option<String>)> = folders
        .iter()
        .map(|f| (f.remote_id.clone(), (f.name.clone(), f.parent_id.clone())))
        .collect();

    for folder in folders.iter_mut() {
        let mut parts = vec![folder.name.clone()];
        let mut visited = HashSet::from([folder.remote_id.clone()]);
        let mut current = folder.parent_id.clone();

        while let Some(parent_id) = current.take() {
            if !visited.insert(parent_id.clone()) {
                break;
            }
            let Some((name, next)) = index.get(&parent_id) else {
                break;
            };
            if name != ROOT_FOLDER {
                parts.push(name.clone());
            }
            current.clone_from(next);
        }

        parts.reverse();
        folder
            .attributes
            .insert("path".to_string(), Value::String(parts.join("/")));
    }
}
