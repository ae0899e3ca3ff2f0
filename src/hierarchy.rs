// Numan Thabit 2025
// hierarchy.rs - node tree and reconfiguration document model

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::actions::{ActionError, ActionTable, SchedulerType};
use crate::api::Task;
use crate::dump::NodeDump;
use crate::metrics::Metrics;
use crate::node::{Node, NodeMessage, PredicateMessage};

/// Errors raised while parsing or validating a configuration document.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("failed to parse configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration document contains no nodes")]
    Empty,
    #[error("node entry is missing an id")]
    MissingId,
    #[error("duplicate node id {0}")]
    DuplicateNode(u32),
    #[error("node {node} references unknown parent {parent}")]
    UnknownParent { node: u32, parent: u32 },
    #[error("parent chain of node {0} contains a cycle")]
    Cycle(u32),
    #[error("node {0} has neither a parent nor an egress port")]
    Unbound(u32),
    #[error("node {0} has both a parent and an egress port")]
    RootWithParent(u32),
    #[error("egress port {0} is bound to more than one root")]
    PortConflict(u32),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("io error while installing hierarchy: {0}")]
    Io(#[from] io::Error),
}

// Raw document shape. Unknown keys are ignored on purpose: the document is
// produced by external tooling that may carry extra fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawDocument {
    tmconfig: RawTmConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawTmConfig {
    tmnodes: Vec<RawNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    // Legacy spelling of the node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    tmnode: Option<u32>,
    scheduler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<BTreeMap<String, Vec<u32>>>,
}

/// One node of a validated hierarchy specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: u32,
    pub scheduler: SchedulerType,
    pub egress_port: Option<u32>,
    pub parent: Option<u32>,
    /// Scheduler parameter seeds: `(index, cells)`.
    pub params: Vec<(usize, Vec<u32>)>,
}

/// Validated shape of a hierarchy: an ordered node list whose first element
/// is the entry node, with parent edges forming a forest rooted at
/// port-bound nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchySpec {
    pub nodes: Vec<NodeSpec>,
}

impl HierarchySpec {
    /// Parses and validates a JSON configuration document.
    pub fn parse(document: &str) -> Result<Self, HierarchyError> {
        let raw: RawDocument = serde_json::from_str(document)?;
        let mut nodes = Vec::with_capacity(raw.tmconfig.tmnodes.len());
        for raw_node in raw.tmconfig.tmnodes {
            let id = raw_node
                .id
                .or(raw_node.tmnode)
                .ok_or(HierarchyError::MissingId)?;
            let params = raw_node
                .params
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(key, values)| match key.parse::<usize>() {
                    Ok(index) => Some((index, values)),
                    Err(_) => {
                        warn!(node = id, key = %key, "ignoring non-numeric parameter index");
                        None
                    }
                })
                .collect();
            nodes.push(NodeSpec {
                id,
                scheduler: SchedulerType::parse(&raw_node.scheduler),
                egress_port: raw_node.port,
                parent: raw_node.parent,
                params,
            });
        }
        let spec = Self { nodes };
        spec.validate()?;
        Ok(spec)
    }

    /// Single root node bound to an egress port; the smallest valid
    /// hierarchy and the default installed at startup.
    pub fn single_root(id: u32, scheduler: SchedulerType, egress_port: u32) -> Self {
        Self {
            nodes: vec![NodeSpec {
                id,
                scheduler,
                egress_port: Some(egress_port),
                parent: None,
                params: Vec::new(),
            }],
        }
    }

    fn validate(&self) -> Result<(), HierarchyError> {
        if self.nodes.is_empty() {
            return Err(HierarchyError::Empty);
        }

        let mut ids = AHashMap::default();
        for (index, node) in self.nodes.iter().enumerate() {
            if ids.insert(node.id, index).is_some() {
                return Err(HierarchyError::DuplicateNode(node.id));
            }
        }

        let mut root_ports = AHashMap::default();
        for node in &self.nodes {
            match (node.parent, node.egress_port) {
                (None, None) => return Err(HierarchyError::Unbound(node.id)),
                (Some(_), Some(_)) => return Err(HierarchyError::RootWithParent(node.id)),
                (Some(parent), None) => {
                    if parent == node.id || !ids.contains_key(&parent) {
                        return Err(HierarchyError::UnknownParent {
                            node: node.id,
                            parent,
                        });
                    }
                }
                (None, Some(port)) => {
                    if root_ports.insert(port, node.id).is_some() {
                        return Err(HierarchyError::PortConflict(port));
                    }
                }
            }
        }

        // Parent chains must terminate at a root within |nodes| hops.
        for node in &self.nodes {
            let mut current = node.parent;
            let mut hops = 0;
            while let Some(parent) = current {
                hops += 1;
                if hops > self.nodes.len() {
                    return Err(HierarchyError::Cycle(node.id));
                }
                current = self.nodes[ids[&parent]].parent;
            }
        }

        Ok(())
    }

    /// The node targeted by enqueue work.
    pub fn entry_id(&self) -> u32 {
        self.nodes[0].id
    }
}

/// An installed, running hierarchy: nodes, their worker threads, and the
/// inbox handles used to address them. Immutable once built.
#[derive(Debug)]
pub struct Hierarchy {
    nodes: Vec<Arc<Node>>,
    inboxes: Vec<Sender<NodeMessage>>,
    predicate_queues: Vec<Sender<PredicateMessage>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Hierarchy {
    /// Builds nodes from a validated spec, wires parent edges, seeds
    /// scheduler parameters, verifies the action table per scheduler type,
    /// and spawns each node's main loop and predicate worker.
    pub fn build(
        spec: &HierarchySpec,
        actions: &ActionTable,
        tm_stream: Sender<Task>,
        metrics: Arc<Metrics>,
        dump_dir: Option<&Path>,
    ) -> Result<Self, HierarchyError> {
        let mut index_of = AHashMap::default();
        for (index, node) in spec.nodes.iter().enumerate() {
            index_of.insert(node.id, index);
        }

        // Channels first, so parent inboxes exist before any node is built.
        let mut inbox_pairs = Vec::with_capacity(spec.nodes.len());
        let mut predicate_pairs = Vec::with_capacity(spec.nodes.len());
        for _ in &spec.nodes {
            inbox_pairs.push(unbounded::<NodeMessage>());
            predicate_pairs.push(unbounded::<PredicateMessage>());
        }

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        for (index, node_spec) in spec.nodes.iter().enumerate() {
            let parent = node_spec
                .parent
                .map(|pid| (pid, inbox_pairs[index_of[&pid]].0.clone()));
            let dump = match dump_dir {
                Some(dir) => Some(NodeDump::for_node(node_spec.id, dir)?),
                None => None,
            };
            let node = Node::new(
                node_spec.id,
                node_spec.scheduler.clone(),
                node_spec.egress_port,
                actions.clone(),
                tm_stream.clone(),
                parent,
                predicate_pairs[index].0.clone(),
                metrics.clone(),
                dump,
            )?;
            node.seed_parameters(&node_spec.params);
            nodes.push(Arc::new(node));
        }

        let mut handles = Vec::with_capacity(nodes.len() * 2);
        for (index, node) in nodes.iter().enumerate() {
            let main_node = node.clone();
            let inbox_rx = inbox_pairs[index].1.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("node-{}", node.id()))
                    .spawn(move || main_node.run(inbox_rx))?,
            );
            let pred_node = node.clone();
            let pred_rx = predicate_pairs[index].1.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("node-{}-pred", node.id()))
                    .spawn(move || pred_node.predicate_worker(pred_rx))?,
            );
        }

        debug!(nodes = nodes.len(), "hierarchy installed");
        Ok(Self {
            nodes,
            inboxes: inbox_pairs.into_iter().map(|(tx, _)| tx).collect(),
            predicate_queues: predicate_pairs.into_iter().map(|(tx, _)| tx).collect(),
            handles: Mutex::new(handles),
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Delivers enqueue work to the entry node.
    pub(crate) fn deliver(&self, task: Task) -> bool {
        self.inboxes[0].send(NodeMessage::Enqueue(task)).is_ok()
    }

    /// Cooperative shutdown: every worker drains its queue up to the
    /// shutdown marker, then exits; join completes once both threads of
    /// every node have stopped.
    pub fn shutdown(&self) {
        for inbox in &self.inboxes {
            let _ = inbox.send(NodeMessage::Shutdown);
        }
        for queue in &self.predicate_queues {
            let _ = queue.send(PredicateMessage::Shutdown);
        }
        let handles = {
            let mut guard = match self.handles.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("node worker panicked during shutdown");
            }
        }
    }
}
