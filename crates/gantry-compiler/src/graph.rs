use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Sink for the model graph: nodes are fingerprints (or synthetic ids),
/// edges are hash inputs. Purely observational; never feeds back into any
/// hash.
pub trait ModelGrapher: Send + Sync {
    fn graph_node(&self, id: &str, label: &str);
    fn graph_edge(&self, from: &str, to: &str);
}

/// Collects the graph and writes it as a deterministic text file, one
/// `node`/`edge` record per line, sorted.
#[derive(Default)]
pub struct GraphWriter {
    nodes: Mutex<BTreeMap<String, String>>,
    edges: Mutex<BTreeSet<(String, String)>>,
}

impl GraphWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut out = std::fs::File::create(path)?;
        let nodes = self
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, label) in nodes.iter() {
            writeln!(out, "node {id} {label}")?;
        }
        let edges = self
            .edges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (from, to) in edges.iter() {
            writeln!(out, "edge {from} {to}")?;
        }
        Ok(())
    }
}

impl ModelGrapher for GraphWriter {
    fn graph_node(&self, id: &str, label: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_owned(), label.to_owned());
    }

    fn graph_edge(&self, from: &str, to: &str) {
        self.edges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((from.to_owned(), to.to_owned()));
    }
}
