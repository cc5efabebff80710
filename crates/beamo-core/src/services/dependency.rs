use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::error::{BeamoError, Result};
use crate::models::{ProtocolType, ServiceDefinition};

/// Walks the dependency graph from `root` and reports whether any path leads back to it.
///
/// Edges to ids missing from `definitions` are dropped. Only cycles through `root` are
/// detected; check every node for a whole-graph guarantee (see [`validate_all_acyclic`]).
pub fn validate_no_cyclical_dependencies(root: &str, definitions: &[ServiceDefinition]) -> bool {
    let by_id: HashMap<&str, &ServiceDefinition> = definitions
        .iter()
        .map(|sd| (sd.beamo_id.as_str(), sd))
        .collect();

    let mut stack: Vec<&str> = vec![root];
    let mut visited: HashSet<&str> = HashSet::new();
    let mut root_count = 0;

    while let Some(current) = stack.pop() {
        if current == root {
            root_count += 1;
            if root_count > 1 {
                return false;
            }
        } else if !visited.insert(current) {
            continue;
        }

        let Some(definition) = by_id.get(current) else {
            continue;
        };
        for dependency in &definition.depends_on_beamo_ids {
            if by_id.contains_key(dependency.as_str()) {
                stack.push(dependency.as_str());
            }
        }
    }

    true
}

/// Checks each of `selected` against `all`, failing on the first cycle.
pub fn validate_all_acyclic(selected: &[ServiceDefinition], all: &[ServiceDefinition]) -> Result<()> {
    for definition in selected {
        if !validate_no_cyclical_dependencies(&definition.beamo_id, all) {
            return Err(BeamoError::CyclicDependency(definition.beamo_id.clone()));
        }
    }
    Ok(())
}

/// Topological layering: every definition lands in a layer after all of its dependencies.
///
/// Dependencies on ids outside `definitions` count as already satisfied. Input order is kept
/// within a layer.
pub fn build_dependency_layers(definitions: &[ServiceDefinition]) -> Result<Vec<Vec<ServiceDefinition>>> {
    let known: HashSet<&str> = definitions.iter().map(|sd| sd.beamo_id.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&ServiceDefinition> = definitions.iter().collect();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&ServiceDefinition>, Vec<&ServiceDefinition>) =
            remaining.into_iter().partition(|sd| {
                sd.depends_on_beamo_ids
                    .iter()
                    .all(|dep| !known.contains(dep.as_str()) || placed.contains(dep.as_str()))
            });

        if ready.is_empty() {
            let stuck: Vec<&str> = blocked.iter().map(|sd| sd.beamo_id.as_str()).collect();
            return Err(BeamoError::CyclicDependency(stuck.join(", ")));
        }

        placed.extend(ready.iter().map(|sd| sd.beamo_id.as_str()));
        debug!(
            layer = layers.len(),
            services = ?ready.iter().map(|sd| &sd.beamo_id).collect::<Vec<_>>(),
            "dependency layer"
        );
        layers.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    Ok(layers)
}

pub fn split_layer_by_protocol(
    layer: &[ServiceDefinition],
) -> BTreeMap<ProtocolType, Vec<ServiceDefinition>> {
    let mut split: BTreeMap<ProtocolType, Vec<ServiceDefinition>> = BTreeMap::new();
    for definition in layer {
        split
            .entry(definition.protocol)
            .or_default()
            .push(definition.clone());
    }
    split
}
