//! Modules and the static registry

use crate::error::{EngineError, Result};
use crate::reconcile::AnyMapper;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A named, ordered group of mappers covering one provider surface.
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    /// Modules that must be reconciled before this one
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Mappers in the order their passes run
    fn mappers(&self) -> Vec<Arc<dyn AnyMapper>>;
}

/// A module with its mappers materialized
pub struct RegisteredModule {
    pub name: &'static str,
    pub version: &'static str,
    pub dependencies: &'static [&'static str],
    pub mappers: Vec<Arc<dyn AnyMapper>>,
}

impl RegisteredModule {
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mappers.iter().map(|m| m.kind())
    }
}

impl std::fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dependencies", &self.dependencies)
            .field("mappers", &self.kinds().collect::<Vec<_>>())
            .finish()
    }
}

/// Modules and mappers selected for one run
#[derive(Debug)]
pub struct Selection<'a> {
    pub module: &'a RegisteredModule,
    pub mappers: Vec<Arc<dyn AnyMapper>>,
}

/// Every module known to the process, in dependency order.
#[derive(Debug)]
pub struct Registry {
    modules: Vec<RegisteredModule>,
    mappers: Vec<Arc<dyn AnyMapper>>,
}

impl Registry {
    /// Validate and order an explicit module list.
    ///
    /// Rejects duplicate module names, duplicate mapper kinds, unknown
    /// module dependencies and dependency cycles. Modules with no ordering
    /// constraint between them keep the order they were given in.
    pub fn new(modules: Vec<Box<dyn Module>>) -> Result<Self> {
        let mut by_name: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut kinds = HashSet::new();
        let mut registered = Vec::with_capacity(modules.len());

        for (index, module) in modules.iter().enumerate() {
            if by_name.insert(module.name(), index).is_some() {
                return Err(EngineError::DuplicateRegistration(format!(
                    "module '{}'",
                    module.name()
                )));
            }
            let mappers = module.mappers();
            for mapper in &mappers {
                if !kinds.insert(mapper.kind()) {
                    return Err(EngineError::DuplicateRegistration(format!(
                        "mapper '{}'",
                        mapper.kind()
                    )));
                }
            }
            registered.push(RegisteredModule {
                name: module.name(),
                version: module.version(),
                dependencies: module.dependencies(),
                mappers,
            });
        }

        for module in &registered {
            if let Some(missing) = module
                .dependencies
                .iter()
                .find(|dep| !by_name.contains_key(**dep))
            {
                return Err(EngineError::UnknownModule(format!(
                    "{} (required by {})",
                    missing, module.name
                )));
            }
        }

        let order = topological_order(&registered, &by_name)?;
        let mut slots: Vec<Option<RegisteredModule>> = registered.into_iter().map(Some).collect();
        let modules: Vec<RegisteredModule> = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();
        let mappers = modules
            .iter()
            .flat_map(|m| m.mappers.iter().cloned())
            .collect();

        Ok(Self { modules, mappers })
    }

    /// Modules in dependency order
    pub fn modules(&self) -> &[RegisteredModule] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&RegisteredModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Every mapper across all modules
    pub fn mappers(&self) -> &[Arc<dyn AnyMapper>] {
        &self.mappers
    }

    /// Narrow a run to one module and/or one mapper kind.
    pub fn select(&self, module: Option<&str>, mapper: Option<&str>) -> Result<Vec<Selection<'_>>> {
        let modules: Vec<&RegisteredModule> = match module {
            Some(name) => vec![
                self.module(name)
                    .ok_or_else(|| EngineError::UnknownModule(name.to_string()))?,
            ],
            None => self.modules.iter().collect(),
        };

        let selection: Vec<Selection<'_>> = modules
            .into_iter()
            .map(|module| Selection {
                module,
                mappers: module
                    .mappers
                    .iter()
                    .filter(|m| mapper.is_none_or(|kind| m.kind() == kind))
                    .cloned()
                    .collect(),
            })
            .filter(|s| mapper.is_none() || !s.mappers.is_empty())
            .collect();

        match mapper {
            Some(kind) if selection.is_empty() => Err(EngineError::UnknownMapper(kind.to_string())),
            _ => Ok(selection),
        }
    }

    /// Modules to add so that `requested` and everything they depend on are
    /// installed, in dependency order. Modules already in `installed` are
    /// left out.
    pub fn install_order(
        &self,
        installed: &BTreeSet<String>,
        requested: &[&str],
    ) -> Result<Vec<&RegisteredModule>> {
        let mut wanted: HashSet<&'static str> = HashSet::new();
        let mut stack = requested
            .iter()
            .map(|name| self.known(name))
            .collect::<Result<Vec<_>>>()?;

        while let Some(module) = stack.pop() {
            if installed.contains(module.name) || !wanted.insert(module.name) {
                continue;
            }
            for dep in module.dependencies {
                stack.push(self.known(dep)?);
            }
        }

        Ok(self
            .modules
            .iter()
            .filter(|m| wanted.contains(m.name))
            .collect())
    }

    /// Installed modules among `requested`, dependents first. Fails while
    /// an installed module outside the request still depends on one of them.
    pub fn uninstall_order(
        &self,
        installed: &BTreeSet<String>,
        requested: &[&str],
    ) -> Result<Vec<&RegisteredModule>> {
        let mut removing: HashSet<&'static str> = HashSet::new();
        for name in requested {
            let module = self.known(name)?;
            if installed.contains(module.name) {
                removing.insert(module.name);
            }
        }

        for module in &self.modules {
            if !installed.contains(module.name) || removing.contains(module.name) {
                continue;
            }
            if let Some(dep) = module.dependencies.iter().find(|d| removing.contains(**d)) {
                return Err(EngineError::ModuleInUse {
                    module: dep.to_string(),
                    dependent: module.name.to_string(),
                });
            }
        }

        Ok(self
            .modules
            .iter()
            .rev()
            .filter(|m| removing.contains(m.name))
            .collect())
    }

    fn known(&self, name: &str) -> Result<&RegisteredModule> {
        self.module(name)
            .ok_or_else(|| EngineError::UnknownModule(name.to_string()))
    }
}

/// Kahn's algorithm, always taking the lowest remaining input index.
fn topological_order(
    modules: &[RegisteredModule],
    by_name: &BTreeMap<&'static str, usize>,
) -> Result<Vec<usize>> {
    let mut remaining: Vec<usize> = modules.iter().map(|m| m.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (index, module) in modules.iter().enumerate() {
        for dep in module.dependencies {
            if let Some(&dep_index) = by_name.get(dep) {
                dependents[dep_index].push(index);
            }
        }
    }

    let mut order = Vec::with_capacity(modules.len());
    let mut done = vec![false; modules.len()];
    while order.len() < modules.len() {
        let Some(next) = (0..modules.len()).find(|&i| !done[i] && remaining[i] == 0) else {
            let cycle = modules
                .iter()
                .enumerate()
                .filter(|(i, _)| !done[*i])
                .map(|(_, m)| m.name.to_string())
                .collect();
            return Err(EngineError::DependencyCycle(cycle));
        };
        done[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::context::Context;
    use crate::entity::Relation;
    use crate::reconcile::{PassEnv, PassOutcome};
    use async_trait::async_trait;

    struct StubMapper(&'static str);

    #[async_trait]
    impl AnyMapper for StubMapper {
        fn kind(&self) -> &'static str {
            self.0
        }

        fn depends_on(&self) -> &'static [&'static str] {
            &[]
        }

        async fn plan(&self, _ctx: &Context, _env: &PassEnv<'_>) -> Result<Vec<Action>> {
            Ok(Vec::new())
        }

        async fn pass(&self, _ctx: &Context, _env: &PassEnv<'_>) -> PassOutcome {
            PassOutcome::default()
        }

        async fn migrate_relation(&self, _ctx: &Context, _from: &Relation, _to: &str) -> Result<usize> {
            Ok(0)
        }
    }

    struct StubModule {
        name: &'static str,
        deps: &'static [&'static str],
        kinds: &'static [&'static str],
    }

    impl Module for StubModule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> &'static [&'static str] {
            self.deps
        }

        fn mappers(&self) -> Vec<Arc<dyn AnyMapper>> {
            self.kinds
                .iter()
                .map(|k| Arc::new(StubMapper(k)) as Arc<dyn AnyMapper>)
                .collect()
        }
    }

    fn module(
        name: &'static str,
        deps: &'static [&'static str],
        kinds: &'static [&'static str],
    ) -> Box<dyn Module> {
        Box::new(StubModule { name, deps, kinds })
    }

    fn names(registry: &Registry) -> Vec<&'static str> {
        registry.modules().iter().map(|m| m.name).collect()
    }

    #[test]
    fn test_dependency_order() {
        let registry = Registry::new(vec![
            module("compute", &["networking"], &["instance"]),
            module("dns", &[], &["record"]),
            module("networking", &[], &["network", "subnet"]),
        ])
        .unwrap();

        assert_eq!(names(&registry), vec!["dns", "networking", "compute"]);
        assert_eq!(registry.mappers().len(), 4);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = Registry::new(vec![
            module("a", &["b"], &["x"]),
            module("b", &["a"], &["y"]),
            module("c", &[], &["z"]),
        ])
        .unwrap_err();

        match err {
            EngineError::DependencyCycle(cycle) => assert_eq!(cycle, vec!["a", "b"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let err = Registry::new(vec![module("compute", &["networking"], &["instance"])]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownModule(_)));
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let err = Registry::new(vec![
            module("a", &[], &["network"]),
            module("b", &[], &["network"]),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration(_)));
    }

    #[test]
    fn test_select() {
        let registry = Registry::new(vec![
            module("networking", &[], &["network", "subnet"]),
            module("compute", &["networking"], &["instance"]),
        ])
        .unwrap();

        assert_eq!(registry.select(None, None).unwrap().len(), 2);

        let only_subnets = registry.select(None, Some("subnet")).unwrap();
        assert_eq!(only_subnets.len(), 1);
        assert_eq!(only_subnets[0].module.name, "networking");
        assert_eq!(only_subnets[0].mappers.len(), 1);

        assert!(matches!(
            registry.select(Some("compute"), Some("subnet")),
            Err(EngineError::UnknownMapper(_))
        ));
        assert!(matches!(
            registry.select(Some("storage"), None),
            Err(EngineError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_debug_names_mapper_kinds() {
        let registry = Registry::new(vec![
            module("networking", &[], &["network", "subnet"]),
            module("compute", &["networking"], &["instance"]),
        ])
        .unwrap();

        let printed = format!("{:?}", registry);
        assert!(printed.contains("networking"));
        assert!(printed.contains("subnet"));

        let selection = registry.select(Some("compute"), None).unwrap();
        assert!(format!("{:?}", selection).contains("instance"));
    }

    fn installed(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn three_tiers() -> Registry {
        Registry::new(vec![
            module("networking", &[], &["network", "subnet"]),
            module("compute", &["networking"], &["instance"]),
            module("balancing", &["compute"], &["load_balancer"]),
            module("dns", &[], &["record"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_install_pulls_in_dependencies() {
        let registry = three_tiers();

        let order = registry.install_order(&installed(&[]), &["balancing"]).unwrap();
        let order: Vec<_> = order.iter().map(|m| m.name).collect();
        assert_eq!(order, vec!["networking", "compute", "balancing"]);

        let order = registry
            .install_order(&installed(&["networking"]), &["balancing", "compute"])
            .unwrap();
        let order: Vec<_> = order.iter().map(|m| m.name).collect();
        assert_eq!(order, vec!["compute", "balancing"]);

        assert!(
            registry
                .install_order(&installed(&["dns"]), &["dns"])
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            registry.install_order(&installed(&[]), &["storage"]),
            Err(EngineError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_uninstall_refuses_while_needed() {
        let registry = three_tiers();
        let everything = installed(&["networking", "compute", "balancing", "dns"]);

        match registry.uninstall_order(&everything, &["networking"]) {
            Err(EngineError::ModuleInUse { module, dependent }) => {
                assert_eq!(module, "networking");
                assert_eq!(dependent, "compute");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let order = registry
            .uninstall_order(&everything, &["networking", "balancing", "compute"])
            .unwrap();
        let order: Vec<_> = order.iter().map(|m| m.name).collect();
        assert_eq!(order, vec!["balancing", "compute", "networking"]);

        // Not installed, nothing to do
        assert!(
            registry
                .uninstall_order(&installed(&["networking"]), &["dns"])
                .unwrap()
                .is_empty()
        );
    }
}
