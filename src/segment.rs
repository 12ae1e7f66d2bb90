//! Append-only tree of execution segments.
//!
//! One tree per request. Every middleware invocation (and any custom unit of
//! work the application opens) becomes a node with a start instant, an end
//! instant, and children nested in temporal start order. The tree is built
//! behind its context's mutex and snapshotted once, at finalization, into
//! the [`SegmentRecord`] that leaves the engine.
//!
//! # Truncation
//!
//! Pathological chains — recursive routers, thousand-step pipelines — must
//! not grow the tree without bound. The tree tracks at most `budget`
//! concurrently open detailed segments; past that, opens collapse into a
//! single placeholder child per ancestor, named `Truncated/<name>` after the
//! first collapsed segment. Collapsed opens keep counting (and their timing
//! keeps extending the placeholder) but their identity is gone. Truncation
//! is never an error.

use std::time::{Duration, Instant};

/// Name prefix carried by a truncation placeholder segment.
pub const TRUNCATED_PREFIX: &str = "Truncated/";

/// Handle to one node in one context's segment tree.
///
/// Ids are plain indices and only meaningful within the tree that issued
/// them; they are `Copy` so wrapper futures and deferrals can hold them
/// across suspension points for free.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SegmentId(u32);

impl SegmentId {
    /// The root segment. Present from context creation, open until
    /// finalization.
    pub const ROOT: SegmentId = SegmentId(0);
}

struct Node {
    name: String,
    started: Instant,
    ended: Option<Instant>,
    children: Vec<SegmentId>,
    parent: Option<SegmentId>,
    truncated: bool,
    /// Placeholders only: how many opens collapsed into this node.
    collapsed: u64,
    /// Placeholders only: completion instant of the latest collapsed
    /// segment. Fixes the placeholder's end time at finalization.
    last_collapse: Option<Instant>,
    /// The placeholder child of this node, once the budget collapses here.
    overflow: Option<SegmentId>,
    placeholder: bool,
}

impl Node {
    fn new(name: String, started: Instant, parent: Option<SegmentId>) -> Self {
        Self {
            name,
            started,
            ended: None,
            children: Vec::new(),
            parent,
            truncated: false,
            collapsed: 0,
            last_collapse: None,
            overflow: None,
            placeholder: false,
        }
    }
}

/// The per-request tree. Nodes live in an arena (`Vec`) and reference each
/// other by index, which keeps the whole structure `Send` and free of
/// interior reference counting.
pub(crate) struct SegmentTree {
    nodes: Vec<Node>,
    /// Concurrently open detailed segments, root excluded.
    open_detail: usize,
    budget: usize,
}

impl SegmentTree {
    pub(crate) fn new(root_name: String, now: Instant, budget: usize) -> Self {
        Self {
            nodes: vec![Node::new(root_name, now, None)],
            open_detail: 0,
            budget: budget.max(1),
        }
    }

    pub(crate) fn root_name(&self) -> &str {
        &self.nodes[SegmentId::ROOT.0 as usize].name
    }

    fn node(&self, id: SegmentId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: SegmentId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Nearest ancestor of `id` (itself included) that is still open.
    ///
    /// A closed node may not gain children, so late opens — a deferral
    /// outliving the middleware that scheduled it — reattach here. The root
    /// stays open until finalization, so the walk always terminates.
    fn nearest_open(&self, id: SegmentId) -> SegmentId {
        let mut current = id;
        loop {
            let node = self.node(current);
            if node.ended.is_none() {
                return current;
            }
            match node.parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    /// Opens a segment under `parent` and returns its id.
    ///
    /// Never fails: once `budget` detailed segments are open, the open
    /// collapses into the parent's placeholder child (creating it on first
    /// overflow) and the placeholder's id comes back instead.
    pub(crate) fn open(&mut self, parent: SegmentId, name: &str, now: Instant) -> SegmentId {
        let parent = self.nearest_open(parent);
        if self.node(parent).placeholder {
            // Work beneath a collapsed region stays collapsed.
            let node = self.node_mut(parent);
            node.collapsed += 1;
            return parent;
        }
        if self.open_detail >= self.budget {
            return self.overflow_into(parent, name, now);
        }
        let id = SegmentId(self.nodes.len() as u32);
        self.nodes.push(Node::new(name.to_owned(), now, Some(parent)));
        self.node_mut(parent).children.push(id);
        self.open_detail += 1;
        id
    }

    fn overflow_into(&mut self, parent: SegmentId, name: &str, now: Instant) -> SegmentId {
        if let Some(placeholder) = self.node(parent).overflow {
            self.node_mut(placeholder).collapsed += 1;
            return placeholder;
        }
        let id = SegmentId(self.nodes.len() as u32);
        let mut node = Node::new(format!("{TRUNCATED_PREFIX}{name}"), now, Some(parent));
        node.truncated = true;
        node.placeholder = true;
        node.collapsed = 1;
        self.nodes.push(node);
        let parent_node = self.node_mut(parent);
        parent_node.children.push(id);
        parent_node.overflow = Some(id);
        id
    }

    /// Closes `id` at `now`. A second close of the same node is a no-op, so
    /// a success path and an error path both firing do no harm. Closing a
    /// placeholder records collapsed activity instead; its end is fixed at
    /// finalization. The root only closes through [`close_all`].
    ///
    /// [`close_all`]: SegmentTree::close_all
    pub(crate) fn close(&mut self, id: SegmentId, now: Instant) {
        let node = self.node_mut(id);
        if node.placeholder {
            node.last_collapse = Some(now);
            return;
        }
        if node.ended.is_some() || node.parent.is_none() {
            return;
        }
        node.ended = Some(now);
        self.open_detail -= 1;
    }

    /// Finalization sweep: every still-open node closes at `now`. Non-root
    /// stragglers — middleware that never delivered a completion — are
    /// marked truncated. Placeholders end at their last collapsed activity.
    pub(crate) fn close_all(&mut self, now: Instant) {
        for node in &mut self.nodes {
            if node.ended.is_some() {
                continue;
            }
            if node.placeholder {
                node.ended = Some(node.last_collapse.unwrap_or(now));
                continue;
            }
            node.ended = Some(now);
            if node.parent.is_some() {
                node.truncated = true;
            }
        }
        self.open_detail = 0;
    }

    /// Snapshots the whole tree. Only meaningful after [`close_all`]; any
    /// node still missing an end time reads as zero-duration.
    ///
    /// [`close_all`]: SegmentTree::close_all
    pub(crate) fn snapshot(&self) -> SegmentRecord {
        self.record_of(SegmentId::ROOT)
    }

    fn record_of(&self, id: SegmentId) -> SegmentRecord {
        let base = self.nodes[SegmentId::ROOT.0 as usize].started;
        let node = self.node(id);
        let ended = node.ended.unwrap_or(node.started);
        SegmentRecord {
            name: node.name.clone(),
            start_offset: node.started.saturating_duration_since(base),
            duration: ended.saturating_duration_since(node.started),
            truncated: node.truncated,
            collapsed: node.collapsed,
            children: node.children.iter().map(|c| self.record_of(*c)).collect(),
        }
    }
}

/// One segment of a finished trace: the immutable, exported form of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Segment name — the middleware's registered name, a custom label, or
    /// `Truncated/<name>` for a placeholder.
    pub name: String,
    /// Start, measured from the trace's root start.
    pub start_offset: Duration,
    pub duration: Duration,
    /// True for placeholders and for segments force-closed at finalization.
    pub truncated: bool,
    /// Number of opens collapsed into this placeholder; zero elsewhere.
    pub collapsed: u64,
    /// Child segments in temporal start order.
    pub children: Vec<SegmentRecord>,
}

impl SegmentRecord {
    /// Time attributed to this segment exclusive of its detailed children
    /// (the number an APM chart puts next to the name). Children that ran
    /// concurrently can drive this to zero; it never goes negative.
    pub fn self_time(&self) -> Duration {
        let nested: Duration = self.children.iter().map(|c| c.duration).sum();
        self.duration.saturating_sub(nested)
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&SegmentRecord> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Total number of segments in this subtree, itself included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SegmentRecord::count).sum::<usize>()
    }
}
