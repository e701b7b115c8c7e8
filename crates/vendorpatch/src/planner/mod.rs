use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

/// Barrier task that waits for every producer of a `sources:*` token.
pub const SOURCES_BARRIER: &str = "core.barrier.sources";
/// Token provided by [`SOURCES_BARRIER`]; the native build waits on it.
pub const SOURCES_DONE: &str = "sources:done";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    /// Task ids or provide tokens; a trailing `?` makes the dependency optional.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    // Resolve a dependency to a concrete task id. Optional deps that match
    // nothing resolve to `None`.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        owner: &str,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!(
            "task '{}' has invalid dependency '{}': unknown task or token",
            owner, dep
        )))
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                if let Some(dep_id) = self.resolve_dep(&provides, id, dep)? {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    /// Topological order (Kahn). Ties break by task id so runs are reproducible.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to) {
                *incoming.entry(to).or_default() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Sub-plan holding only `ids`, in their original relative order.
    /// Dependencies on tasks left out become optional.
    pub fn select(&self, ids: &[&str]) -> Result<Plan> {
        let mut out = Plan::default();
        for id in ids {
            let task = self
                .tasks
                .get(*id)
                .ok_or_else(|| Error::msg(format!("task '{id}' is not part of the plan")))?;
            let mut task = task.clone();
            for dep in &mut task.after {
                if !dep.ends_with('?') {
                    dep.push('?');
                }
            }
            out.add(task)?;
        }
        Ok(out)
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_sources_barrier()
    }

    // Anything providing a `sources:*` token contributes to the source tree
    // the native build consumes. The barrier lets consumers depend on one
    // token instead of enumerating producers.
    fn add_sources_barrier(&mut self) -> Result<()> {
        if self.tasks.contains_key(SOURCES_BARRIER) {
            return Ok(());
        }
        let deps: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.provides.iter().any(|p| p.starts_with("sources:")))
            .map(|t| t.id.clone())
            .collect();

        self.add(Task {
            id: SOURCES_BARRIER.into(),
            label: "Sources barrier".into(),
            module: "core".into(),
            phase: "barrier".into(),
            after: deps,
            provides: vec![SOURCES_DONE.into()],
        })
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
        }
        out.push_str("}\n");
        Ok(out)
    }
}
