use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

/// Crates that must stay free of storage, transport and runtime code.
const RULES: &[(&str, &[&str])] = &[
    (
        "transit-contracts",
        &["sqlx", "axum", "tokio", "transit-policy", "transit-ledger", "transit-gateway"],
    ),
    (
        "transit-policy",
        &["sqlx", "axum", "tokio", "transit-ledger", "transit-gateway"],
    ),
    ("transit-ledger", &["axum", "transit-gateway"]),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;

    for (package_name, forbidden) in RULES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name.as_str() == *package_name)
            .with_context(|| format!("package `{}` not found in workspace", package_name))?;

        let violations = forbidden_dependencies(&package.id, &adjacency, &id_to_name, forbidden);

        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                forbidden.join(", ")
            );
        } else {
            failed = true;
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}

/// Walks the resolved graph from `root` and returns the sorted names of every
/// reachable package listed in `forbidden`.
fn forbidden_dependencies<Id>(
    root: &Id,
    adjacency: &HashMap<Id, Vec<Id>>,
    id_to_name: &HashMap<Id, &str>,
    forbidden: &[&str],
) -> Vec<String>
where
    Id: Clone + Eq + Hash,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && forbidden.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}
