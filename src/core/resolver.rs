//! KN-003: Dependency DAG construction and topological ordering.
//!
//! Builds a DAG from future references and `after` edges and computes a
//! topological order using Kahn's algorithm. Ties are broken by declaration
//! order so the same module always yields the same plan.

use super::error::{KilnError, Result};
use super::types::{ExecutionPlan, Module};
use std::collections::{BTreeSet, HashMap};

/// Compute the execution order for a module.
pub fn build_execution_order(module: &Module) -> Result<ExecutionPlan> {
    let ids: Vec<&str> = module.descriptors.keys().map(String::as_str).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut in_degree = vec![0usize; ids.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];

    for (i, descriptor) in module.descriptors.values().enumerate() {
        for dep in descriptor.dependencies() {
            let d = *index.get(dep).ok_or_else(|| KilnError::UnknownReference {
                from: descriptor.id.clone(),
                to: dep.to_string(),
            })?;
            dependents[d].push(i);
            dependencies[i].push(d);
            in_degree[i] += 1;
        }
    }

    // Kahn's algorithm; the ready set is ordered by declaration index
    let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());

    while let Some(current) = ready.pop_first() {
        order.push(ids[current].to_string());
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != ids.len() {
        let cycle = find_cycle(&in_degree, &dependencies)
            .into_iter()
            .map(|i| ids[i].to_string())
            .collect();
        return Err(KilnError::CyclicDependency { cycle });
    }

    Ok(ExecutionPlan {
        module: module.name.clone(),
        order,
    })
}

/// Walk unresolved dependency edges from the first stuck node until a node repeats.
fn find_cycle(in_degree: &[usize], dependencies: &[Vec<usize>]) -> Vec<usize> {
    let stuck = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..in_degree.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        // A stuck node always has at least one stuck dependency
        let Some(&next) = dependencies[current].iter().find(|&&d| stuck(d)) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::build_module;
    use crate::core::types::ArgValue;
    use indexmap::IndexMap;
    use proptest::prelude::*;

    fn chain_module(decls: &[(&str, &[&str])]) -> Module {
        let decls: Vec<(String, Vec<String>)> = decls
            .iter()
            .map(|(id, deps)| (id.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect();
        build_module("M", move |m| {
            for (id, deps) in &decls {
                let args = deps.iter().map(|d| ArgValue::future(d.clone())).collect();
                m.define(id, "Contract", args)?;
            }
            Ok(IndexMap::new())
        })
        .unwrap()
    }

    #[test]
    fn test_kn003_topo_linear() {
        let module = chain_module(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let plan = build_execution_order(&module).unwrap();
        assert_eq!(plan.order, vec!["a", "b", "c"]);
        assert_eq!(plan.module, "M");
    }

    #[test]
    fn test_kn003_independent_keep_declaration_order() {
        let module = chain_module(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        let plan = build_execution_order(&module).unwrap();
        assert_eq!(plan.order, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_kn003_topo_diamond() {
        let module = chain_module(&[
            ("bottom", &["right", "left"]),
            ("right", &["top"]),
            ("left", &["top"]),
            ("top", &[]),
        ]);
        let plan = build_execution_order(&module).unwrap();
        assert_eq!(plan.order, vec!["top", "right", "left", "bottom"]);
    }

    #[test]
    fn test_kn003_after_edges_order() {
        let module = build_module("M", |m| {
            let registry = m.define("registry", "Registry", vec![])?;
            let token = m.define_after("token", "Token", vec![], &[&registry])?;
            m.define_after("pool", "Pool", vec![], &[&token])?;
            Ok(IndexMap::new())
        })
        .unwrap();
        let plan = build_execution_order(&module).unwrap();
        assert_eq!(plan.order, vec!["registry", "token", "pool"]);
    }

    #[test]
    fn test_kn003_topo_cycle_named() {
        let module = chain_module(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        let err = build_execution_order(&module).unwrap_err();
        match err {
            KilnError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_kn003_self_reference() {
        let module = chain_module(&[("a", &["a"])]);
        let err = build_execution_order(&module).unwrap_err();
        assert!(err.to_string().contains("a -> a"));
    }

    #[test]
    fn test_kn003_cycle_behind_dependent() {
        // `top` is stuck only because it waits on the cycle
        let module = chain_module(&[("top", &["x"]), ("x", &["y"]), ("y", &["x"])]);
        match build_execution_order(&module).unwrap_err() {
            KilnError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["x", "y", "x"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_kn003_deterministic() {
        let module = chain_module(&[("b", &[]), ("a", &[]), ("c", &["a", "b"])]);
        let first = build_execution_order(&module).unwrap();
        for _ in 0..10 {
            assert_eq!(build_execution_order(&module).unwrap(), first);
        }
    }

    fn random_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        // Edges only point from node i to lower indices, so the graph is acyclic.
        (1usize..20).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(0usize..n, 0..4), n).prop_map(
                move |raw| {
                    raw.into_iter()
                        .enumerate()
                        .map(|(i, deps)| deps.into_iter().filter(|&d| d < i).collect())
                        .collect()
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_kn003_order_respects_edges(dag in random_dag(), reversed in any::<bool>()) {
            let n = dag.len();
            // Declare in reverse rank sometimes so forward references are exercised
            let ranks: Vec<usize> = if reversed { (0..n).rev().collect() } else { (0..n).collect() };
            let module = build_module("P", |m| {
                for &i in &ranks {
                    let args = dag[i].iter().map(|d| ArgValue::future(format!("n{d}"))).collect();
                    m.define(&format!("n{i}"), "C", args)?;
                }
                Ok(IndexMap::new())
            }).unwrap();

            let plan = build_execution_order(&module).unwrap();
            prop_assert_eq!(plan.order.len(), n);
            let pos: HashMap<&str, usize> =
                plan.order.iter().enumerate().map(|(p, id)| (id.as_str(), p)).collect();
            for (i, deps) in dag.iter().enumerate() {
                for d in deps {
                    let me = format!("n{i}");
                    let dep = format!("n{d}");
                    prop_assert!(pos[dep.as_str()] < pos[me.as_str()]);
                }
            }
            prop_assert_eq!(build_execution_order(&module).unwrap(), plan);
        }

        #[test]
        fn prop_kn003_closing_edge_is_cycle(len in 2usize..10) {
            let module = build_module("P", |m| {
                for i in 0..len {
                    let dep = (i + 1) % len;
                    m.define(&format!("n{i}"), "C", vec![ArgValue::future(format!("n{dep}"))])?;
                }
                Ok(IndexMap::new())
            }).unwrap();
            let is_cycle = matches!(
                build_execution_order(&module),
                Err(KilnError::CyclicDependency { ref cycle }) if cycle.len() == len + 1
            );
            prop_assert!(is_cycle);
        }
    }
}
