//! Graph and node model.
//!
//! A [`GraphInner`] owns an ordered list of nodes and is shared (`Arc`)
//! between the `Workflow` that built it, module nodes referencing it, and the
//! topologies compiled from it. Structure mutations happen through the
//! builder API only; a compiled topology works on its own snapshot, so edits
//! made after a submission affect later submissions only.

use crate::builder::Subflow;
use crate::executor::Runtime;
use crate::semaphore::Semaphore;
use crate::topology::Topology;
use crate::types::HashSet;
use derive_more::Debug;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Task body variants.
#[derive(Debug)]
pub(crate) enum NodeBody {
    /// Plain callable.
    Static(#[debug(skip)] Box<dyn Fn() + Send + Sync>),
    /// Returns the index of the successor branch to take.
    Condition(#[debug(skip)] Box<dyn Fn() -> usize + Send + Sync>),
    /// Returns the indices of every successor branch to take.
    MultiCondition(#[debug(skip)] Box<dyn Fn() -> Vec<usize> + Send + Sync>),
    /// Builds a child graph at execution time.
    Subflow(#[debug(skip)] Box<dyn Fn(&mut Subflow<'_>) + Send + Sync>),
    /// Runs with scheduler access on the executing worker.
    Runtime(#[debug(skip)] Box<dyn Fn(&mut Runtime<'_>) + Send + Sync>),
    /// Reference to another workflow's graph, inlined at submission.
    Module(Arc<GraphInner>),
    /// Placeholder; does nothing when reached.
    Noop,
}

impl NodeBody {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::Condition(_) => "condition",
            Self::MultiCondition(_) => "multi_condition",
            Self::Subflow(_) => "subflow",
            Self::Runtime(_) => "runtime",
            Self::Module(_) => "module",
            Self::Noop => "placeholder",
        }
    }

    fn is_condition(&self) -> bool {
        matches!(self, Self::Condition(_) | Self::MultiCondition(_))
    }
}

/// Mutable (build-time) part of a node.
#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub(crate) name: Option<String>,
    /// Successor node indices, in edge insertion order. For condition nodes
    /// the position in this list is the branch index.
    pub(crate) successors: Vec<u32>,
    pub(crate) predecessors: Vec<u32>,
    /// Semaphores acquired before the body runs, in insertion order.
    #[debug(skip)]
    pub(crate) acquires: Vec<Arc<Semaphore>>,
    /// Semaphores released after the body runs.
    #[debug(skip)]
    pub(crate) releases: Vec<Arc<Semaphore>>,
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) body: NodeBody,
    pub(crate) state: Mutex<NodeState>,
}

impl Node {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-workflow run bookkeeping: at most one root topology executes at a
/// time; further submissions queue FIFO behind it.
#[derive(Default)]
pub(crate) struct GraphSched {
    pub(crate) active: Option<Arc<Topology>>,
    pub(crate) queue: VecDeque<Arc<Topology>>,
}

/// Shared graph storage behind `Workflow`.
#[derive(Debug)]
pub(crate) struct GraphInner {
    pub(crate) name: String,
    pub(crate) nodes: Mutex<Vec<Arc<Node>>>,
    #[debug(skip)]
    pub(crate) sched: Mutex<GraphSched>,
}

impl GraphInner {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            nodes: Mutex::new(Vec::new()),
            sched: Mutex::new(GraphSched::default()),
        })
    }

    pub(crate) fn lock_nodes(&self) -> MutexGuard<'_, Vec<Arc<Node>>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_sched(&self) -> MutexGuard<'_, GraphSched> {
        self.sched.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add_node(&self, body: NodeBody) -> u32 {
        let mut nodes = self.lock_nodes();
        let idx = u32::try_from(nodes.len()).expect("graph node count overflows u32");
        nodes.push(Arc::new(Node {
            body,
            state: Mutex::new(NodeState::default()),
        }));
        idx
    }

    pub(crate) fn num_nodes(&self) -> usize {
        self.lock_nodes().len()
    }

    /// Whether a root run of this graph is currently executing or queued.
    pub(crate) fn is_executing(&self) -> bool {
        self.lock_sched().active.is_some()
    }

    /// Add the edge `pred -> succ`.
    pub(crate) fn precede(&self, pred: u32, succ: u32) {
        assert_ne!(pred, succ, "a task cannot precede itself");
        let nodes = self.lock_nodes();
        let (pred_node, succ_node) = (&nodes[pred as usize], &nodes[succ as usize]);
        // Lock order follows node index so concurrent edge insertion between
        // the same pair cannot deadlock.
        let (mut first, mut second) = if pred < succ {
            let first = pred_node.lock_state();
            let second = succ_node.lock_state();
            (first, second)
        } else {
            let second = succ_node.lock_state();
            let first = pred_node.lock_state();
            (first, second)
        };
        first.successors.push(succ);
        second.predecessors.push(pred);
    }

    /// Render the graph in DOT. Module references are rendered as clusters,
    /// condition edges carry their branch index as label.
    pub(crate) fn dump<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writeln!(writer, "digraph {} {{", dot_quote(&self.name))?;
        let mut seen = HashSet::default();
        seen.insert(self as *const Self as usize);
        self.dump_body(writer, &mut seen, 1)?;
        writeln!(writer, "}}")
    }

    fn dump_body<W: fmt::Write>(
        &self,
        writer: &mut W,
        seen: &mut HashSet<usize>,
        depth: usize,
    ) -> fmt::Result {
        let graph_id = self as *const Self as usize;
        let pad = "  ".repeat(depth);
        let nodes = self.lock_nodes();
        for (idx, node) in nodes.iter().enumerate() {
            let state = node.lock_state();
            let label = match &state.name {
                Some(name) => name.clone(),
                None => format!("{}{idx}", node.body.kind()),
            };
            let shape = if node.body.is_condition() {
                " shape=diamond"
            } else {
                ""
            };
            writeln!(
                writer,
                "{pad}g{graph_id:x}_n{idx} [label={}{shape}];",
                dot_quote(&label)
            )?;
            for (branch, &succ) in state.successors.iter().enumerate() {
                if node.body.is_condition() {
                    writeln!(
                        writer,
                        "{pad}g{graph_id:x}_n{idx} -> g{graph_id:x}_n{succ} [label=\"{branch}\" style=dashed];"
                    )?;
                } else {
                    writeln!(writer, "{pad}g{graph_id:x}_n{idx} -> g{graph_id:x}_n{succ};")?;
                }
            }
        }
        // Expand each referenced module graph once.
        for node in nodes.iter() {
            let NodeBody::Module(module) = &node.body else {
                continue;
            };
            let module_id = Arc::as_ptr(module) as usize;
            if !seen.insert(module_id) {
                continue;
            }
            writeln!(writer, "{pad}subgraph cluster_g{module_id:x} {{")?;
            writeln!(writer, "{pad}  label={};", dot_quote(&module.name))?;
            module.dump_body(writer, seen, depth + 1)?;
            writeln!(writer, "{pad}}}")?;
        }
        Ok(())
    }
}

fn dot_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_record_both_directions() {
        let graph = GraphInner::new("g".into());
        let a = graph.add_node(NodeBody::Noop);
        let b = graph.add_node(NodeBody::Noop);
        graph.precede(a, b);

        let nodes = graph.lock_nodes();
        assert_eq!(nodes[a as usize].lock_state().successors, vec![b]);
        assert_eq!(nodes[b as usize].lock_state().predecessors, vec![a]);
    }

    #[test]
    #[should_panic(expected = "cannot precede itself")]
    fn self_edge_rejected() {
        let graph = GraphInner::new("g".into());
        let a = graph.add_node(NodeBody::Noop);
        graph.precede(a, a);
    }

    #[test]
    fn dump_labels_condition_branches() {
        let graph = GraphInner::new("cond".into());
        let c = graph.add_node(NodeBody::Condition(Box::new(|| 0)));
        let t0 = graph.add_node(NodeBody::Noop);
        let t1 = graph.add_node(NodeBody::Noop);
        graph.lock_nodes()[c as usize].lock_state().name = Some("choose".into());
        graph.precede(c, t0);
        graph.precede(c, t1);

        let mut out = String::new();
        graph.dump(&mut out).unwrap();
        assert!(out.starts_with("digraph \"cond\" {"));
        assert!(out.contains("label=\"choose\" shape=diamond"));
        assert!(out.contains("[label=\"0\" style=dashed]"));
        assert!(out.contains("[label=\"1\" style=dashed]"));
    }

    #[test]
    fn dump_renders_module_cluster_once() {
        let inner = GraphInner::new("inner".into());
        inner.add_node(NodeBody::Noop);
        let outer = GraphInner::new("outer".into());
        outer.add_node(NodeBody::Module(inner.clone()));
        outer.add_node(NodeBody::Module(inner));

        let mut out = String::new();
        outer.dump(&mut out).unwrap();
        assert_eq!(out.matches("subgraph cluster_").count(), 1);
        assert!(out.contains("label=\"inner\";"));
    }
}
