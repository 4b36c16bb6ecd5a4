use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::descriptor::ResourceDescriptor;
use crate::error::GraphError;
use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declarada con `depends_on`: orden sin referencia de datos.
    Explicit,
    /// Sale de una referencia tipada dentro de la config.
    Inferred,
}

/// Arista `from -> to`: `from` depende de `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: ResourceId,
    pub to: ResourceId,
    pub kind: EdgeKind,
}

/// Grafo ya ordenado: los descriptores quedan en orden topológico.
#[derive(Debug, Clone)]
pub struct OrderedPlan {
    descriptors: Vec<ResourceDescriptor>,
    index: HashMap<ResourceId, usize>,
    // índices dentro de `descriptors`
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    edges: Vec<Edge>,
}

/// Ordena los descriptores respetando todas las aristas.
///
/// Empates por orden de declaración, así que la misma entrada siempre da el
/// mismo plan. No tiene efectos secundarios.
pub fn build(descriptors: &[ResourceDescriptor]) -> Result<OrderedPlan, GraphError> {
    let n = descriptors.len();

    // 1) Ids únicos
    let mut decl_index: HashMap<&str, usize> = HashMap::with_capacity(n);
    for (i, d) in descriptors.iter().enumerate() {
        if decl_index.insert(d.id(), i).is_some() {
            return Err(GraphError::DuplicateId {
                id: d.id().to_string(),
            });
        }
    }

    // 2) Aristas explícitas + inferidas, todas resueltas
    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut edges: Vec<Edge> = Vec::new();

    for (i, d) in descriptors.iter().enumerate() {
        let explicit = d.explicit_dependencies().iter().map(|t| (t, EdgeKind::Explicit));
        let inferred = d
            .inferred_dependencies()
            .into_iter()
            .map(|t| (t, EdgeKind::Inferred));

        for (target, kind) in explicit.chain(inferred) {
            let j = *decl_index.get(target.as_str()).ok_or_else(|| {
                GraphError::UnresolvedDependency {
                    from: d.id().to_string(),
                    to: target.clone(),
                }
            })?;
            if deps[i].insert(j) {
                edges.push(Edge {
                    from: d.id().to_string(),
                    to: target.clone(),
                    kind,
                });
            }
        }
    }

    // 3) Kahn con el conjunto de listos ordenado por declaración
    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &j in ds {
            reverse[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(n);

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &k in &reverse[i] {
            remaining[k] -= 1;
            if remaining[k] == 0 {
                ready.insert(k);
            }
        }
    }

    if order.len() < n {
        let stuck: Vec<usize> = (0..n).filter(|&i| remaining[i] > 0).collect();
        let involved = nodes_on_cycles(&stuck, &deps);
        return Err(GraphError::CyclicDependency {
            involved_ids: involved
                .into_iter()
                .map(|i| descriptors[i].id().to_string())
                .collect(),
        });
    }

    // 4) Reindexar en orden del plan
    let mut position = vec![0usize; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let ordered: Vec<ResourceDescriptor> = order.iter().map(|&i| descriptors[i].clone()).collect();
    let index = ordered
        .iter()
        .enumerate()
        .map(|(pos, d)| (d.id().to_string(), pos))
        .collect();

    let mut dependencies = vec![Vec::new(); n];
    let mut dependents = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &j in ds {
            dependencies[position[i]].push(position[j]);
            dependents[position[j]].push(position[i]);
        }
    }
    for list in dependencies.iter_mut().chain(dependents.iter_mut()) {
        list.sort_unstable();
    }

    Ok(OrderedPlan {
        descriptors: ordered,
        index,
        dependencies,
        dependents,
        edges,
    })
}

/// Nodos que están sobre algún ciclo (SCC de más de un nodo o self-loop),
/// en orden de declaración. Los que sólo cuelgan de un ciclo no cuentan.
fn nodes_on_cycles(candidates: &[usize], deps: &[BTreeSet<usize>]) -> Vec<usize> {
    struct Tarjan<'a> {
        deps: &'a [BTreeSet<usize>],
        allowed: &'a BTreeSet<usize>,
        next: usize,
        index: HashMap<usize, usize>,
        low: HashMap<usize, usize>,
        stack: Vec<usize>,
        on_stack: BTreeSet<usize>,
        cyclic: BTreeSet<usize>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index.insert(v, self.next);
            self.low.insert(v, self.next);
            self.next += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            let (deps, allowed) = (self.deps, self.allowed);
            for &w in deps[v].iter().filter(|w| allowed.contains(*w)) {
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let low = self.low[&v].min(self.low[&w]);
                    self.low.insert(v, low);
                } else if self.on_stack.contains(&w) {
                    let low = self.low[&v].min(self.index[&w]);
                    self.low.insert(v, low);
                }
            }

            if self.low[&v] == self.index[&v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                let self_loop = self.deps[v].contains(&v);
                if component.len() > 1 || self_loop {
                    self.cyclic.extend(component);
                }
            }
        }
    }

    let allowed: BTreeSet<usize> = candidates.iter().copied().collect();
    let mut t = Tarjan {
        deps,
        allowed: &allowed,
        next: 0,
        index: HashMap::new(),
        low: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        cyclic: BTreeSet::new(),
    };
    for &v in candidates {
        if !t.index.contains_key(&v) {
            t.visit(v);
        }
    }
    t.cyclic.into_iter().collect()
}

impl OrderedPlan {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptores en orden de ejecución.
    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(ResourceDescriptor::id)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.index.get(id).map(|&i| &self.descriptors[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Dependencias directas de `id`, en orden del plan.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.dependencies)
    }

    /// Recursos que dependen directamente de `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbours(id, &self.dependents)
    }

    /// Todo lo que tiene que existir antes que `id` (clausura transitiva).
    pub fn ancestors(&self, id: &str) -> BTreeSet<&str> {
        self.closure(id, &self.dependencies)
    }

    /// Subárbol que queda bloqueado si `id` falla.
    pub fn descendants(&self, id: &str) -> BTreeSet<&str> {
        self.closure(id, &self.dependents)
    }

    /// Grupos que pueden ejecutarse en paralelo: cada recurso queda en el
    /// primer nivel posterior a todas sus dependencias.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        let mut level = vec![0usize; self.len()];
        let mut waves: Vec<Vec<&str>> = Vec::new();
        for i in 0..self.len() {
            let lvl = self.dependencies[i]
                .iter()
                .map(|&j| level[j] + 1)
                .max()
                .unwrap_or(0);
            level[i] = lvl;
            if waves.len() <= level[i] {
                waves.resize_with(level[i] + 1, Vec::new);
            }
            waves[level[i]].push(self.descriptors[i].id());
        }
        waves
    }

    /// Orden de destrucción: el inverso del plan.
    pub fn teardown_order(&self) -> Vec<&str> {
        self.descriptors.iter().rev().map(ResourceDescriptor::id).collect()
    }

    pub(crate) fn dependency_indices(&self, pos: usize) -> &[usize] {
        &self.dependencies[pos]
    }

    pub(crate) fn dependent_indices(&self, pos: usize) -> &[usize] {
        &self.dependents[pos]
    }

    fn neighbours<'a>(&'a self, id: &str, adj: &[Vec<usize>]) -> Vec<&'a str> {
        match self.index.get(id) {
            Some(&i) => adj[i].iter().map(|&j| self.descriptors[j].id()).collect(),
            None => Vec::new(),
        }
    }

    fn closure<'a>(&'a self, id: &str, adj: &[Vec<usize>]) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return seen;
        };
        let mut stack = adj[start].clone();
        while let Some(j) = stack.pop() {
            if seen.insert(self.descriptors[j].id()) {
                stack.extend(adj[j].iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CatalogDatabaseConfig, ResourceConfig};

    /// Descriptor mínimo sin referencias tipadas, sólo aristas explícitas.
    fn node(id: &str, deps: &[&str]) -> ResourceDescriptor {
        let cfg = ResourceConfig::CatalogDatabase(CatalogDatabaseConfig {
            database_name: id.to_string(),
            description: String::new(),
        });
        deps.iter()
            .fold(ResourceDescriptor::new(id, cfg).unwrap(), |d, dep| d.depends_on(*dep))
    }

    fn assert_topological(plan: &OrderedPlan) {
        for d in plan.descriptors() {
            let pos = plan.position(d.id()).unwrap();
            for dep in plan.dependencies(d.id()) {
                assert!(
                    plan.position(dep).unwrap() < pos,
                    "{dep} debería ir antes que {}",
                    d.id()
                );
            }
        }
    }

    #[test]
    fn build_respeta_todas_las_aristas() {
        let input = vec![
            node("crawler", &["copy-files", "catalog"]),
            node("copy-files", &["create-directories"]),
            node("catalog", &[]),
            node("create-directories", &["bucket"]),
            node("bucket", &[]),
        ];
        let plan = build(&input).unwrap();
        assert_eq!(plan.len(), 5);
        assert_topological(&plan);
    }

    #[test]
    fn escenario_de_orden_directorios_copia_crawler() {
        let input = vec![
            node("crawler", &["copy-files"]),
            node("copy-files", &["create-directories"]),
            node("create-directories", &[]),
        ];
        let plan = build(&input).unwrap();
        let dirs = plan.position("create-directories").unwrap();
        let copy = plan.position("copy-files").unwrap();
        let crawler = plan.position("crawler").unwrap();
        assert!(dirs < copy);
        assert!(copy < crawler);
    }

    #[test]
    fn empates_se_resuelven_por_orden_de_declaracion() {
        let input = vec![node("c", &[]), node("a", &[]), node("b", &["c"])];
        let plan = build(&input).unwrap();
        assert_eq!(plan.ids().collect::<Vec<_>>(), vec!["c", "a", "b"]);

        // misma entrada, mismo plan
        let again = build(&input).unwrap();
        assert_eq!(
            plan.ids().collect::<Vec<_>>(),
            again.ids().collect::<Vec<_>>()
        );
    }

    #[test]
    fn ciclo_nombra_todos_sus_nodos_y_solo_esos() {
        let input = vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("downstream", &["a"]),
            node("libre", &[]),
        ];
        let err = build(&input).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                involved_ids: vec!["a".into(), "b".into(), "c".into()],
            }
        );
    }

    #[test]
    fn self_loop_es_un_ciclo() {
        let err = build(&[node("solo", &["solo"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                involved_ids: vec!["solo".into()],
            }
        );
    }

    #[test]
    fn dependencia_sin_resolver_falla() {
        let err = build(&[node("a", &["fantasma"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnresolvedDependency {
                from: "a".into(),
                to: "fantasma".into(),
            }
        );
    }

    #[test]
    fn ids_duplicados_fallan() {
        let err = build(&[node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateId { id: "a".into() });
    }

    #[test]
    fn clausuras_waves_y_teardown() {
        let input = vec![
            node("bucket", &[]),
            node("dirs", &["bucket"]),
            node("copy", &["dirs"]),
            node("crawler", &["copy"]),
            node("catalog", &[]),
        ];
        let plan = build(&input).unwrap();

        assert_eq!(
            plan.descendants("dirs").into_iter().collect::<Vec<_>>(),
            vec!["copy", "crawler"]
        );
        assert_eq!(
            plan.ancestors("crawler").into_iter().collect::<Vec<_>>(),
            vec!["bucket", "copy", "dirs"]
        );
        assert_eq!(
            plan.waves(),
            vec![
                vec!["bucket", "catalog"],
                vec!["dirs"],
                vec!["copy"],
                vec!["crawler"],
            ]
        );
        assert_eq!(
            plan.teardown_order(),
            vec!["catalog", "crawler", "copy", "dirs", "bucket"]
        );
    }

    #[test]
    fn aristas_quedan_etiquetadas() {
        use crate::descriptor::{FunctionConfig, IdentityRoleConfig};

        let role = ResourceDescriptor::new(
            "role",
            ResourceConfig::IdentityRole(IdentityRoleConfig {
                role_name: "r".into(),
                assumed_by: "lambda.amazonaws.com".into(),
                managed_policies: vec![],
                statements: vec![],
            }),
        )
        .unwrap();
        let f = ResourceDescriptor::new(
            "fn",
            ResourceConfig::InvokableFunction(FunctionConfig {
                function_name: "f".into(),
                handler: "h".into(),
                runtime: "python3.12".into(),
                timeout_secs: 10,
                role: "role".into(),
            }),
        )
        .unwrap()
        .depends_on("role");

        let plan = build(&[f, role]).unwrap();
        // la explícita y la inferida apuntan a lo mismo: una sola arista
        assert_eq!(plan.edges().len(), 1);
        assert_eq!(plan.edges()[0].kind, EdgeKind::Explicit);
        assert_eq!(plan.ids().collect::<Vec<_>>(), vec!["role", "fn"]);
    }
}
