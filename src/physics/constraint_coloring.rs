use crate::physics::constraint_graph::ConstraintGraph;
use crate::physics::handles::GraphEdgeHandle;
use crate::utilities::collections::IndexSet;
use std::ops::Range;

/// One rule's constraints within one island, grouped into `(level, color)` buckets.
///
/// Bucket `level * num_colors + color` spans `offsets[b]..offsets[b + 1]` of `constraints`. Buckets of one
/// level are contiguous and levels are ascending, so walking `constraints` front to back is a valid serial
/// solve order too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IslandBuckets {
    pub constraints: Vec<u32>,
    pub offsets: Vec<u32>,
    pub num_levels: u32,
    pub num_colors: u32,
}

/// Constraint with its assigned level and color, as fed to [`IslandBuckets::sort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    pub constraint_index: u32,
    pub level: u32,
    pub color: u32,
}

impl IslandBuckets {
    /// Single bucket holding `constraints` in the given order.
    pub fn serial(constraints: Vec<u32>) -> Self {
        let count = constraints.len() as u32;
        Self {
            constraints,
            offsets: vec![0, count],
            num_levels: 1,
            num_colors: 1,
        }
    }

    /// Counting sort by `level * num_colors + color`. Stable: entries sharing a bucket keep their input order,
    /// which makes sorting an already sorted list a no-op.
    pub fn sort(entries: &[BucketEntry], num_levels: u32, num_colors: u32) -> Self {
        let num_levels = num_levels.max(1);
        let num_colors = num_colors.max(1);
        let bucket_count = (num_levels * num_colors) as usize;
        let bucket_of = |entry: &BucketEntry| {
            debug_assert!(entry.level < num_levels && entry.color < num_colors);
            (entry.level * num_colors + entry.color) as usize
        };

        let mut offsets = vec![0u32; bucket_count + 1];
        for entry in entries {
            offsets[bucket_of(entry) + 1] += 1;
        }
        for bucket in 0..bucket_count {
            offsets[bucket + 1] += offsets[bucket];
        }
        let mut cursors = offsets[..bucket_count].to_vec();
        let mut constraints = vec![0u32; entries.len()];
        for entry in entries {
            let cursor = &mut cursors[bucket_of(entry)];
            constraints[*cursor as usize] = entry.constraint_index;
            *cursor += 1;
        }
        Self {
            constraints,
            offsets,
            num_levels,
            num_colors,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    #[inline(always)]
    pub fn bucket_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Slot range of the constraints with the given level and color.
    #[inline(always)]
    pub fn bucket(&self, level: u32, color: u32) -> Range<usize> {
        let bucket = (level * self.num_colors + color) as usize;
        self.offsets[bucket] as usize..self.offsets[bucket + 1] as usize
    }

    /// Slot range of every constraint on the given level.
    #[inline(always)]
    pub fn level(&self, level: u32) -> Range<usize> {
        let first = (level * self.num_colors) as usize;
        let last = first + self.num_colors as usize;
        self.offsets[first] as usize..self.offsets[last] as usize
    }
}

/// Greedily colors `edges` so no two edges of the same color share a dynamic particle.
///
/// Edges are visited by ascending level, keeping their given order within a level. Each takes the lowest
/// color whose particle set it fits in. Colors are written into the graph; the color count is returned.
/// `color_sets` is scratch reused across calls.
pub fn color_edges(
    graph: &mut ConstraintGraph,
    edges: &[GraphEdgeHandle],
    particle_count: usize,
    color_sets: &mut Vec<IndexSet>,
) -> u32 {
    let mut ordered: Vec<(u32, GraphEdgeHandle)> = edges
        .iter()
        .filter_map(|&handle| graph.edge(handle).map(|edge| (edge.level, handle)))
        .collect();
    ordered.sort_by_key(|&(level, _)| level);

    for set in color_sets.iter_mut() {
        set.clear();
    }
    let mut num_colors = 0usize;
    let mut dynamic = Vec::with_capacity(2);
    for (_, handle) in ordered {
        let Some(edge) = graph.edge(handle) else {
            continue;
        };
        dynamic.clear();
        dynamic.extend(edge.dynamic_particles());
        dynamic.dedup();
        let color = match color_sets[..num_colors]
            .iter()
            .position(|set| set.can_fit(&dynamic))
        {
            Some(color) => color,
            None => {
                if color_sets.len() == num_colors {
                    color_sets.push(IndexSet::new(particle_count));
                }
                num_colors += 1;
                num_colors - 1
            }
        };
        for &particle in &dynamic {
            color_sets[color].add(particle);
        }
        graph.set_edge_color(handle, Some(color as u32));
    }
    num_colors as u32
}
