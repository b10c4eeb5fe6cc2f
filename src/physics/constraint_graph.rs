use crate::physics::constraints::PARTICLES_PER_CONSTRAINT;
use crate::physics::handles::{ConstraintId, GraphEdgeHandle, GraphNodeHandle};
use crate::utilities::memory::Arena;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Island index of nodes and edges that have not been assigned one yet.
pub const NO_ISLAND: u32 = u32::MAX;

/// Graph node for one dynamic particle. Kinematic particles never get nodes.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub particle: u32,
    pub edges: Vec<GraphEdgeHandle>,
    pub island: u32,
    /// Edge distance from the nearest node sharing an edge with a kinematic particle.
    /// Zero for every node of an island without kinematic anchors.
    pub depth: u32,
}

/// Graph edge for one constraint.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: ConstraintId,
    pub particles: [u32; PARTICLES_PER_CONSTRAINT],
    /// Node of each particle; `None` where the particle is kinematic.
    pub nodes: [Option<GraphNodeHandle>; PARTICLES_PER_CONSTRAINT],
    pub island: u32,
    pub level: u32,
    /// Written by the owning rule when it colors the island.
    pub color: Option<u32>,
    seen: bool,
}

impl GraphEdge {
    /// Whether the edge links at least one kinematic particle. Such edges anchor their island.
    #[inline(always)]
    pub fn touches_kinematic(&self) -> bool {
        self.nodes.iter().any(Option::is_none)
    }

    /// Dynamic particles linked by the edge.
    #[inline(always)]
    pub fn dynamic_particles(&self) -> impl Iterator<Item = u32> + '_ {
        self.particles
            .iter()
            .zip(&self.nodes)
            .filter(|(_, node)| node.is_some())
            .map(|(&particle, _)| particle)
    }
}

/// Connected component of dynamic particles and the constraints linking them.
#[derive(Debug, Clone, Default)]
pub struct Island {
    pub nodes: Vec<GraphNodeHandle>,
    /// Edges in breadth-first enumeration order.
    pub edges: Vec<GraphEdgeHandle>,
    pub max_level: u32,
}

impl Island {
    #[inline(always)]
    pub fn num_particles(&self) -> usize {
        self.nodes.len()
    }
}

/// Graph of dynamic particles linked by the constraints of every rule using islands.
///
/// Rebuilt incrementally each step: rules re-add their edges between [`ConstraintGraph::begin_build`] and
/// [`ConstraintGraph::end_build`]. Edges whose constraint still links the same particles keep their handles;
/// edges not re-added are removed along with any node left without edges. Islands and levels are only
/// recomputed, and [`ConstraintGraph::topology_version`] only bumped, when something actually changed.
#[derive(Debug, Default)]
pub struct ConstraintGraph {
    nodes: Arena<GraphNode>,
    edges: Arena<GraphEdge>,
    particle_to_node: Vec<Option<GraphNodeHandle>>,
    constraint_to_edge: Vec<Vec<Option<GraphEdgeHandle>>>,
    islands: Vec<Island>,
    topology_version: u64,
    topology_dirty: bool,
    levels_enabled: bool,
    kinematic_only_edges: usize,
}

impl ConstraintGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a rule's container. Edges are keyed by `(container id, constraint index)`.
    pub fn register_container(&mut self) -> u32 {
        self.constraint_to_edge.push(Vec::new());
        (self.constraint_to_edge.len() - 1) as u32
    }

    #[inline(always)]
    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    #[inline(always)]
    pub fn islands(&self) -> &[Island] {
        &self.islands
    }

    #[inline(always)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline(always)]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Constraints skipped during the last build because every particle they link is kinematic.
    #[inline(always)]
    pub fn kinematic_only_edges(&self) -> usize {
        self.kinematic_only_edges
    }

    #[inline(always)]
    pub fn node(&self, handle: GraphNodeHandle) -> Option<&GraphNode> {
        self.nodes.get(handle.0)
    }

    #[inline(always)]
    pub fn edge(&self, handle: GraphEdgeHandle) -> Option<&GraphEdge> {
        self.edges.get(handle.0)
    }

    pub fn edge_handle(&self, id: ConstraintId) -> Option<GraphEdgeHandle> {
        self.constraint_to_edge
            .get(id.container_id as usize)?
            .get(id.constraint_index as usize)
            .copied()
            .flatten()
    }

    pub fn edge_for(&self, id: ConstraintId) -> Option<&GraphEdge> {
        self.edge_handle(id).and_then(|handle| self.edge(handle))
    }

    pub fn node_for_particle(&self, particle: u32) -> Option<&GraphNode> {
        self.particle_to_node
            .get(particle as usize)
            .copied()
            .flatten()
            .and_then(|handle| self.node(handle))
    }

    /// Island of a dynamic particle, or `None` if the particle is kinematic or unconstrained.
    pub fn island_of_particle(&self, particle: u32) -> Option<u32> {
        self.node_for_particle(particle).map(|node| node.island)
    }

    /// Deepest level of any island.
    pub fn max_level(&self) -> u32 {
        self.islands
            .iter()
            .map(|island| island.max_level)
            .max()
            .unwrap_or(0)
    }

    #[inline(always)]
    pub(crate) fn set_edge_color(&mut self, handle: GraphEdgeHandle, color: Option<u32>) {
        if let Some(edge) = self.edges.get_mut(handle.0) {
            edge.color = color;
        }
    }

    /// Starts a build pass. Every edge is provisionally unseen until re-added.
    pub fn begin_build(&mut self, particle_count: usize) {
        if self.particle_to_node.len() < particle_count {
            self.particle_to_node.resize(particle_count, None);
        }
        for edge in self.edges.values_mut() {
            edge.seen = false;
        }
        self.topology_dirty = false;
        self.kinematic_only_edges = 0;
    }

    /// Adds or refreshes the edge for a constraint.
    ///
    /// `kinematic` flags which particles have zero inverse mass. Constraints linking only kinematic particles
    /// are not added and return `None`.
    pub fn add_edge(
        &mut self,
        id: ConstraintId,
        particles: [u32; PARTICLES_PER_CONSTRAINT],
        kinematic: [bool; PARTICLES_PER_CONSTRAINT],
    ) -> Option<GraphEdgeHandle> {
        let existing = self.edge_handle(id);
        if let Some(handle) = existing {
            if let Some(edge) = self.edges.get_mut(handle.0) {
                let unchanged = edge.particles == particles
                    && edge
                        .nodes
                        .iter()
                        .zip(kinematic)
                        .all(|(node, is_kinematic)| node.is_none() == is_kinematic);
                if unchanged {
                    edge.seen = true;
                    return Some(handle);
                }
            }
            self.remove_edge(handle);
        }

        if kinematic.iter().all(|&is_kinematic| is_kinematic) {
            self.kinematic_only_edges += 1;
            return None;
        }

        let mut nodes = [None; PARTICLES_PER_CONSTRAINT];
        for (slot, (&particle, &is_kinematic)) in nodes.iter_mut().zip(particles.iter().zip(&kinematic)) {
            if !is_kinematic {
                *slot = Some(self.get_or_create_node(particle));
            }
        }
        let handle = GraphEdgeHandle(self.edges.insert(GraphEdge {
            id,
            particles,
            nodes,
            island: NO_ISLAND,
            level: 0,
            color: None,
            seen: true,
        }));
        for (k, node) in nodes.iter().enumerate() {
            // A constraint linking a particle to itself is recorded on its node once.
            if let Some(node) = node {
                if nodes[..k].contains(&Some(*node)) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(node.0) {
                    node.edges.push(handle);
                }
            }
        }

        let container_edges = &mut self.constraint_to_edge[id.container_id as usize];
        let index = id.constraint_index as usize;
        if container_edges.len() <= index {
            container_edges.resize(index + 1, None);
        }
        container_edges[index] = Some(handle);
        self.topology_dirty = true;
        Some(handle)
    }

    fn get_or_create_node(&mut self, particle: u32) -> GraphNodeHandle {
        let index = particle as usize;
        if self.particle_to_node.len() <= index {
            self.particle_to_node.resize(index + 1, None);
        }
        if let Some(handle) = self.particle_to_node[index] {
            if self.nodes.contains(handle.0) {
                return handle;
            }
        }
        let handle = GraphNodeHandle(self.nodes.insert(GraphNode {
            particle,
            edges: Vec::new(),
            island: NO_ISLAND,
            depth: 0,
        }));
        self.particle_to_node[index] = Some(handle);
        handle
    }

    fn remove_edge(&mut self, handle: GraphEdgeHandle) {
        let Some(edge) = self.edges.remove(handle.0) else {
            return;
        };
        for node in edge.nodes.iter().flatten() {
            if let Some(node) = self.nodes.get_mut(node.0) {
                node.edges.retain(|&edge| edge != handle);
            }
        }
        if let Some(slot) = self
            .constraint_to_edge
            .get_mut(edge.id.container_id as usize)
            .and_then(|edges| edges.get_mut(edge.id.constraint_index as usize))
        {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        self.topology_dirty = true;
    }

    /// Finishes a build pass: drops stale edges and orphaned nodes, then recomputes islands and levels if
    /// the topology changed. Returns whether it did.
    pub fn end_build(&mut self, use_levels: bool) -> bool {
        let stale_edges: Vec<GraphEdgeHandle> = self
            .edges
            .iter()
            .filter(|(_, edge)| !edge.seen)
            .map(|(handle, _)| GraphEdgeHandle(handle))
            .collect();
        for handle in stale_edges {
            self.remove_edge(handle);
        }

        let orphans: Vec<(GraphNodeHandle, u32)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.edges.is_empty())
            .map(|(handle, node)| (GraphNodeHandle(handle), node.particle))
            .collect();
        for (handle, particle) in orphans {
            self.nodes.remove(handle.0);
            if let Some(slot) = self.particle_to_node.get_mut(particle as usize) {
                if *slot == Some(handle) {
                    *slot = None;
                }
            }
            self.topology_dirty = true;
        }

        if !self.topology_dirty && use_levels == self.levels_enabled {
            return false;
        }
        self.levels_enabled = use_levels;
        self.compute_islands();
        if use_levels {
            self.compute_levels();
        }
        self.topology_version += 1;
        debug!(
            topology_version = self.topology_version,
            islands = self.islands.len(),
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            max_level = self.max_level(),
            "constraint graph topology changed"
        );
        true
    }

    fn compute_islands(&mut self) {
        let Self {
            nodes,
            edges,
            islands,
            ..
        } = self;
        islands.clear();
        for node in nodes.values_mut() {
            node.island = NO_ISLAND;
            node.depth = 0;
        }
        for edge in edges.values_mut() {
            edge.island = NO_ISLAND;
            edge.level = 0;
            edge.color = None;
        }

        let seeds: Vec<GraphNodeHandle> = nodes
            .iter()
            .map(|(handle, _)| GraphNodeHandle(handle))
            .collect();
        let mut queue = VecDeque::new();
        for seed in seeds {
            let island_index = islands.len() as u32;
            match nodes.get_mut(seed.0) {
                Some(node) if node.island == NO_ISLAND => node.island = island_index,
                _ => continue,
            }
            let mut island = Island::default();
            queue.push_back(seed);
            while let Some(current) = queue.pop_front() {
                island.nodes.push(current);
                let Some(node) = nodes.get(current.0) else {
                    continue;
                };
                let incident = node.edges.clone();
                for edge_handle in incident {
                    let Some(edge) = edges.get_mut(edge_handle.0) else {
                        continue;
                    };
                    if edge.island != NO_ISLAND {
                        continue;
                    }
                    edge.island = island_index;
                    island.edges.push(edge_handle);
                    for neighbor in edge.nodes.iter().flatten() {
                        if let Some(neighbor_node) = nodes.get_mut(neighbor.0) {
                            if neighbor_node.island == NO_ISLAND {
                                neighbor_node.island = island_index;
                                queue.push_back(*neighbor);
                            }
                        }
                    }
                }
            }
            islands.push(island);
        }
    }

    fn compute_levels(&mut self) {
        let Self {
            nodes,
            edges,
            islands,
            ..
        } = self;
        let mut queue = VecDeque::new();
        for island in islands.iter_mut() {
            queue.clear();
            for &handle in &island.nodes {
                let Some(node) = nodes.get(handle.0) else {
                    continue;
                };
                let anchored = node.edges.iter().any(|edge| {
                    edges
                        .get(edge.0)
                        .is_some_and(GraphEdge::touches_kinematic)
                });
                if anchored {
                    queue.push_back(handle);
                }
            }
            if queue.is_empty() {
                // Nothing to propagate from: the whole island is level 0.
                island.max_level = 0;
                continue;
            }

            for &seed in &queue {
                if let Some(node) = nodes.get_mut(seed.0) {
                    node.depth = 0;
                }
            }
            let mut reached: HashSet<GraphNodeHandle> = queue.iter().copied().collect();
            while let Some(current) = queue.pop_front() {
                let Some(node) = nodes.get(current.0) else {
                    continue;
                };
                let depth = node.depth;
                let incident = node.edges.clone();
                for edge_handle in incident {
                    let Some(edge) = edges.get(edge_handle.0) else {
                        continue;
                    };
                    for neighbor in edge.nodes.iter().flatten() {
                        if reached.insert(*neighbor) {
                            if let Some(neighbor_node) = nodes.get_mut(neighbor.0) {
                                neighbor_node.depth = depth + 1;
                            }
                            queue.push_back(*neighbor);
                        }
                    }
                }
            }

            let mut max_level = 0;
            for &edge_handle in &island.edges {
                let Some(edge) = edges.get(edge_handle.0) else {
                    continue;
                };
                let level = if edge.touches_kinematic() {
                    0
                } else {
                    edge.nodes
                        .iter()
                        .flatten()
                        .filter_map(|node| nodes.get(node.0))
                        .map(|node| node.depth)
                        .max()
                        .unwrap_or(0)
                };
                if let Some(edge) = edges.get_mut(edge_handle.0) {
                    edge.level = level;
                }
                max_level = max_level.max(level);
            }
            island.max_level = max_level;
        }
    }
}
