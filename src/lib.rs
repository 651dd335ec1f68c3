//! # NN-descent candidate maintenance
//!
//! The heap-and-sampling core of an NN-descent k-NN graph builder:
//! - A Tausworthe generator ([`tau_rand_int`], [`tau_rand`], [`TauRng`])
//! - Rejection sampling of distinct indices ([`rejection_sample`])
//! - A bounded per-point max-heap of neighbors ([`NeighborHeap`])
//! - In-place heap sort into ascending neighbor lists ([`NeighborHeap::deheap_sort`])
//! - Candidate pools for the next refinement pass ([`build_candidates`])
//!
//! Distances come from any `anndists::Distance<f32>` (L2, Cosine, L1, …). The
//! refinement loop itself is left to the caller; see `demos/nn_descent.rs`.
//!
//! ## Example
//! ```
//! use anndists::dist::DistL2;
//! use rust_nndescent::{build_candidates, init_random_graph, CandidateFilter, TauRng};
//!
//! let data: Vec<Vec<f32>> = (0..32).map(|i| vec![i as f32, (i % 4) as f32]).collect();
//! let mut rng = TauRng::from_seed(42);
//!
//! let mut graph = init_random_graph(&data, 5, DistL2, &mut rng)?;
//! let candidates = build_candidates(&mut graph, 32, 5, 10, CandidateFilter::NewEdges, &mut rng)?;
//! assert_eq!(candidates.n_points(), 32);
//!
//! let knn = graph.into_sorted_graph();
//! let first: Vec<(i32, f32)> = knn.neighbors(0).collect();
//! assert!(first.windows(2).all(|w| w[0].1 <= w[1].1));
//! # Ok::<(), rust_nndescent::NnDescentError>(())
//! ```
//!
//! ## Graph file layout
//! [ metadata_len:u64 ][ metadata (bincode) ][ padding up to indices_offset ]
//! [ indices (n * k * i32) ][ distances (n * k * f32) ]
//!
//! `indices_offset` is aligned to 64 bytes.

use anndists::prelude::Distance;
use log::{debug, warn};
use memmap2::Mmap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Index-plane sentinel for an unfilled heap slot.
pub const EMPTY_INDEX: i32 = -1;

/// Defaults for NN-descent runs
pub const DEFAULT_N_NEIGHBORS: usize = 15;
pub const DEFAULT_MAX_CANDIDATES: usize = 60;
pub const DEFAULT_SEED: u64 = 42;

/// `tau_rand_int` results are scaled by this to land in [-1, 1].
const TAU_INT_SCALE: f32 = 0x7fff_ffff as f32;

/// Smallest seed words the three Tausworthe registers accept without collapsing.
const TAU_MIN_STATE: [u32; 3] = [2, 8, 16];

const GRAPH_FORMAT_VERSION: u32 = 1;
const GRAPH_DATA_ALIGN: u64 = 64;

/// Which slots of the current graph feed the candidate pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateFilter {
    /// Only slots whose index is negative (unfilled). Each still costs one
    /// draw and clears its flag; on a fully populated graph this selects nothing.
    #[default]
    UnfilledSlots,
    /// Filled slots still flagged as new since the last pass.
    NewEdges,
}

/// Optional bag of knobs for a refinement run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NnDescentParams {
    pub n_neighbors: usize,
    pub max_candidates: usize,
    pub seed: u64,
    pub candidate_filter: CandidateFilter,
}
impl Default for NnDescentParams {
    fn default() -> Self {
        Self {
            n_neighbors: DEFAULT_N_NEIGHBORS,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            seed: DEFAULT_SEED,
            candidate_filter: CandidateFilter::default(),
        }
    }
}

impl NnDescentParams {
    /// Generator seeded from `self.seed`.
    pub fn rng(&self) -> TauRng {
        TauRng::from_seed(self.seed)
    }
}

/// Custom error type for NN-descent operations
#[derive(Debug, Error)]
pub enum NnDescentError {
    /// I/O errors while saving or opening a graph file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Graph metadata serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// More distinct samples requested than the pool holds
    #[error("cannot draw {n_samples} distinct samples from a pool of {pool_size}")]
    PoolExhausted { n_samples: usize, pool_size: usize },

    /// Tausworthe state that can only repeat a single value
    #[error("Tausworthe state {state:?} is degenerate: the generator would repeat one value forever")]
    DegenerateState { state: TauState },

    /// Input vectors of unequal length
    #[error("vector {point} has dimension {found} but expected {expected}")]
    InvalidDimension {
        point: usize,
        expected: usize,
        found: usize,
    },

    /// A neighbor index that is not a row of the target heap
    #[error("neighbor index {index} is not a row of a heap with {n_points} points")]
    InvalidIndex { index: i32, n_points: usize },

    /// Shape mismatches and malformed graph files
    #[error("Graph error: {0}")]
    GraphError(String),
}

// tausworthe rng

/// Three 32-bit Tausworthe registers.
pub type TauState = [u32; 3];

/// One step of the three registers, on 32-bit words with sign-extending `>>`.
#[inline(always)]
fn tau_words(state: &TauState) -> [i32; 3] {
    let a = state[0] as i32;
    let b = state[1] as i32;
    let c = state[2] as i32;
    let s0 = ((a & !1) << 12) ^ (((a << 13) ^ a) >> 19);
    let s1 = ((b & !7) << 4) ^ (((b << 2) ^ b) >> 25);
    let s2 = ((c & !15) << 17) ^ (((c << 3) ^ c) >> 11);
    [s0, s1, s2]
}

/// Pseudo-random 32-bit integer derived from `state`. May be negative.
///
/// `state` is not advanced: the same state always yields the same value.
/// Use [`TauRng`] for a stream of values.
#[inline]
pub fn tau_rand_int(state: &TauState) -> i32 {
    let [s0, s1, s2] = tau_words(state);
    s0 ^ s1 ^ s2
}

/// `tau_rand_int(state) / 0x7fffffff`, a float in [-1, 1]. Does not advance `state`.
#[inline]
pub fn tau_rand(state: &TauState) -> f32 {
    tau_rand_int(state) as f32 / TAU_INT_SCALE
}

/// True when one step of `state` lands on all zeros or on `state` itself.
fn is_stuck(state: &TauState) -> bool {
    let [s0, s1, s2] = tau_words(state);
    let next = [s0 as u32, s1 as u32, s2 as u32];
    next == [0; 3] || next == *state
}

/// Advancing Tausworthe generator.
///
/// Each draw returns what [`tau_rand_int`] returns for the current state and
/// then writes the three new register words back, so successive draws differ.
/// The handle is passed explicitly (`&mut TauRng`) through every sampling call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TauRng {
    state: TauState,
}

impl TauRng {
    /// Wrap an explicit state.
    ///
    /// A state whose first step is all zero, or maps onto itself, would
    /// repeat one value forever and is rejected with `DegenerateState`.
    /// Words below `[2, 8, 16]` are otherwise accepted with a warning.
    pub fn new(state: TauState) -> Result<Self, NnDescentError> {
        if is_stuck(&state) {
            return Err(NnDescentError::DegenerateState { state });
        }
        if state.iter().zip(TAU_MIN_STATE).any(|(&s, min)| s < min) {
            warn!(
                "Tausworthe state {:?} is below the register minimums {:?}; the stream may collapse",
                state, TAU_MIN_STATE
            );
        }
        Ok(Self { state })
    }

    /// Seed the three registers from a `StdRng`, keeping each above its minimum.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let state = [
            rng.gen_range(TAU_MIN_STATE[0]..=u32::MAX),
            rng.gen_range(TAU_MIN_STATE[1]..=u32::MAX),
            rng.gen_range(TAU_MIN_STATE[2]..=u32::MAX),
        ];
        Self { state }
    }

    /// Current register words.
    pub fn state(&self) -> TauState {
        self.state
    }

    #[inline]
    pub fn next_int(&mut self) -> i32 {
        let [s0, s1, s2] = tau_words(&self.state);
        self.state = [s0 as u32, s1 as u32, s2 as u32];
        s0 ^ s1 ^ s2
    }

    #[inline]
    pub fn next_float(&mut self) -> f32 {
        self.next_int() as f32 / TAU_INT_SCALE
    }
}

// sampling

/// Draw `n_samples` distinct indices from `[0, pool_size)` by rejection.
///
/// Slots are filled from last to first; a draw that collides with an
/// already placed value is discarded and redrawn. If a rejected draw leaves
/// the generator state unchanged the stream can never produce a new value,
/// and `DegenerateState` is returned instead of looping.
pub fn rejection_sample(
    n_samples: usize,
    pool_size: usize,
    rng: &mut TauRng,
) -> Result<Vec<usize>, NnDescentError> {
    if n_samples > pool_size {
        return Err(NnDescentError::PoolExhausted {
            n_samples,
            pool_size,
        });
    }

    let mut result = vec![0usize; n_samples];
    for i in (0..n_samples).rev() {
        loop {
            let before = rng.state;
            let j = i64::from(rng.next_int()).rem_euclid(pool_size as i64) as usize;
            if !result[i + 1..].contains(&j) {
                result[i] = j;
                break;
            }
            if rng.state == before {
                return Err(NnDescentError::DegenerateState { state: before });
            }
        }
    }
    Ok(result)
}

/// Euclidean norm of `vec`.
pub fn norm(vec: &[f32]) -> f32 {
    vec.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// neighbor heap

/// Bounded max-heap of neighbors for every point, stored as three flat
/// row-major planes (indices, weights, is-new flags) of `n_points * size`.
///
/// Within a row, `weights[0]` is the largest kept weight, so the root is the
/// neighbor evicted when a better one arrives. Unfilled slots hold
/// `(EMPTY_INDEX, +inf, false)`. An index appears at most once per row.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborHeap {
    n_points: usize,
    size: usize,
    indices: Vec<i32>,
    weights: Vec<f32>,
    flags: Vec<bool>,
}

impl NeighborHeap {
    /// Allocate `n_points` empty rows of `size` slots.
    pub fn new(n_points: usize, size: usize) -> Self {
        assert!(
            n_points <= i32::MAX as usize,
            "{} points do not fit the i32 index plane",
            n_points
        );
        let len = n_points * size;
        Self {
            n_points,
            size,
            indices: vec![EMPTY_INDEX; len],
            weights: vec![f32::INFINITY; len],
            flags: vec![false; len],
        }
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Slots per row.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn indices(&self, row: usize) -> &[i32] {
        &self.indices[self.row_range(row)]
    }

    pub fn weights(&self, row: usize) -> &[f32] {
        &self.weights[self.row_range(row)]
    }

    pub fn flags(&self, row: usize) -> &[bool] {
        &self.flags[self.row_range(row)]
    }

    /// Root of `row`: the worst kept `(index, weight)`, or `None` for a zero-size heap.
    pub fn peek_worst(&self, row: usize) -> Option<(i32, f32)> {
        let range = self.row_range(row);
        if range.is_empty() {
            return None;
        }
        Some((self.indices[range.start], self.weights[range.start]))
    }

    /// Try to insert `(index, weight, flag)` into `row`.
    ///
    /// Rejected (returns `false`, heap untouched) unless `weight` is strictly
    /// below the current root, or if `index` is already in the row. Otherwise
    /// the root is discarded, the newcomer sifts down, and `true` is returned.
    pub fn push(&mut self, row: usize, weight: f32, index: i32, flag: bool) -> bool {
        let range = self.row_range(row);
        if range.is_empty() {
            return false;
        }
        let indices = &mut self.indices[range.clone()];
        let weights = &mut self.weights[range.clone()];
        let flags = &mut self.flags[range];

        // NaN never improves
        if !(weight < weights[0]) {
            return false;
        }
        if indices.contains(&index) {
            return false;
        }

        replace_root(indices, weights, flags, weight, index, flag);
        true
    }

    /// Heap-sort every row in place: ascending weight, nearest first.
    ///
    /// Flags travel with their index and weight. Rows are independent and
    /// are sorted in parallel.
    pub fn deheap_sort(&mut self) {
        if self.size == 0 || self.n_points == 0 {
            return;
        }
        let size = self.size;
        self.indices
            .par_chunks_mut(size)
            .zip(self.weights.par_chunks_mut(size))
            .zip(self.flags.par_chunks_mut(size))
            .for_each(|((indices, weights), flags)| sort_row(indices, weights, flags));
        debug!("deheap-sorted {} rows of {} slots", self.n_points, size);
    }

    /// Sort every row and hand the index and weight planes over as a [`KnnGraph`].
    pub fn into_sorted_graph(mut self) -> KnnGraph {
        self.deheap_sort();
        KnnGraph {
            n_points: self.n_points,
            k: self.size,
            indices: self.indices,
            distances: self.weights,
        }
    }

    fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        assert!(
            row < self.n_points,
            "row {} out of range for a heap of {} points",
            row,
            self.n_points
        );
        row * self.size..(row + 1) * self.size
    }
}

/// Overwrite the root with the newcomer and sift it down.
/// The left child is preferred unless the right one is strictly heavier.
fn replace_root(
    indices: &mut [i32],
    weights: &mut [f32],
    flags: &mut [bool],
    weight: f32,
    index: i32,
    flag: bool,
) {
    let size = weights.len();
    let mut i = 0;
    loop {
        let ic1 = 2 * i + 1;
        let ic2 = ic1 + 1;

        let swap = if ic1 >= size {
            break;
        } else if ic2 >= size {
            if weights[ic1] > weight {
                ic1
            } else {
                break;
            }
        } else if weights[ic1] >= weights[ic2] {
            if weight < weights[ic1] {
                ic1
            } else {
                break;
            }
        } else if weight < weights[ic2] {
            ic2
        } else {
            break;
        };

        indices[i] = indices[swap];
        weights[i] = weights[swap];
        flags[i] = flags[swap];
        i = swap;
    }

    indices[i] = index;
    weights[i] = weight;
    flags[i] = flag;
}

fn sort_row(indices: &mut [i32], weights: &mut [f32], flags: &mut [bool]) {
    for end in (1..weights.len()).rev() {
        indices.swap(0, end);
        weights.swap(0, end);
        flags.swap(0, end);
        sift_down(
            &mut indices[..end],
            &mut weights[..end],
            &mut flags[..end],
            0,
        );
    }
}

fn sift_down(indices: &mut [i32], weights: &mut [f32], flags: &mut [bool], mut root: usize) {
    let len = weights.len();
    while root * 2 + 1 < len {
        let left = root * 2 + 1;
        let right = left + 1;
        let mut swap = root;

        if weights[swap] < weights[left] {
            swap = left;
        }
        if right < len && weights[swap] < weights[right] {
            swap = right;
        }
        if swap == root {
            break;
        }

        indices.swap(root, swap);
        weights.swap(root, swap);
        flags.swap(root, swap);
        root = swap;
    }
}

/// Allocate an empty heap; see [`NeighborHeap::new`].
pub fn make_heap(n_points: usize, size: usize) -> NeighborHeap {
    NeighborHeap::new(n_points, size)
}

/// Bounded insert; see [`NeighborHeap::push`].
pub fn heap_push(heap: &mut NeighborHeap, row: usize, weight: f32, index: i32, flag: bool) -> bool {
    heap.push(row, weight, index, flag)
}

/// Sort every row in place and return the same heap; see [`NeighborHeap::deheap_sort`].
pub fn deheap_sort(heap: &mut NeighborHeap) -> &mut NeighborHeap {
    heap.deheap_sort();
    heap
}

// candidates

/// Build the candidate pool for the next refinement pass.
///
/// Every slot `(i, j)` with `i < n_vertices`, `j < n_neighbors` that `filter`
/// selects is given a random priority from `rng` and pushed symmetrically:
/// row `i` receives the neighbor, and the neighbor's row receives `i` (when
/// the neighbor is a real row). The slot's new-flag is then cleared in
/// `current_graph`. Vertices and slots are visited from last to first.
///
/// With [`CandidateFilter::UnfilledSlots`] the selected neighbor is always
/// `EMPTY_INDEX`, so the reverse push is skipped: `-1` is never read as the
/// last row. The forward push collides with the `EMPTY_INDEX` already held by
/// the fresh candidate row and is rejected, leaving the pool empty.
pub fn build_candidates(
    current_graph: &mut NeighborHeap,
    n_vertices: usize,
    n_neighbors: usize,
    max_candidates: usize,
    filter: CandidateFilter,
    rng: &mut TauRng,
) -> Result<NeighborHeap, NnDescentError> {
    if n_vertices > current_graph.n_points || n_neighbors > current_graph.size {
        return Err(NnDescentError::GraphError(format!(
            "requested {} vertices x {} neighbors from a graph of {} x {}",
            n_vertices, n_neighbors, current_graph.n_points, current_graph.size
        )));
    }

    let size = current_graph.size;
    let selected = |idx: i32, is_new: bool| match filter {
        CandidateFilter::UnfilledSlots => idx < 0,
        CandidateFilter::NewEdges => idx >= 0 && is_new,
    };

    // validate before touching any flag
    for i in 0..n_vertices {
        for &idx in &current_graph.indices[i * size..i * size + n_neighbors] {
            if idx >= 0 && idx as usize >= n_vertices {
                return Err(NnDescentError::InvalidIndex {
                    index: idx,
                    n_points: n_vertices,
                });
            }
        }
    }

    let mut candidates = NeighborHeap::new(n_vertices, max_candidates);
    let mut visited = 0usize;
    let mut accepted = 0usize;
    for i in (0..n_vertices).rev() {
        for j in (0..n_neighbors).rev() {
            let slot = i * size + j;
            let idx = current_graph.indices[slot];
            let is_new = current_graph.flags[slot];
            if !selected(idx, is_new) {
                continue;
            }

            let d = rng.next_float();
            accepted += candidates.push(i, d, idx, is_new) as usize;
            if idx >= 0 {
                accepted += candidates.push(idx as usize, d, i as i32, is_new) as usize;
            }
            current_graph.flags[slot] = false;
            visited += 1;
        }
    }

    debug!(
        "built candidates ({:?}): {} slots visited, {} pushes accepted",
        filter, visited, accepted
    );
    Ok(candidates)
}

/// [`build_candidates`] over the whole graph with `params.max_candidates`
/// and `params.candidate_filter`.
pub fn build_candidates_with_params(
    current_graph: &mut NeighborHeap,
    params: &NnDescentParams,
    rng: &mut TauRng,
) -> Result<NeighborHeap, NnDescentError> {
    let n_vertices = current_graph.n_points;
    let n_neighbors = current_graph.size;
    build_candidates(
        current_graph,
        n_vertices,
        n_neighbors,
        params.max_candidates,
        params.candidate_filter,
        rng,
    )
}

// initialization

/// Seed a graph with `n_neighbors` random neighbors per point.
///
/// Each point draws distinct candidates with [`rejection_sample`], scores
/// them with `dist` and pushes them flagged as new. Self-matches are skipped,
/// so a row may keep fewer than `n_neighbors` filled slots.
pub fn init_random_graph<D>(
    data: &[Vec<f32>],
    n_neighbors: usize,
    dist: D,
    rng: &mut TauRng,
) -> Result<NeighborHeap, NnDescentError>
where
    D: Distance<f32>,
{
    if data.is_empty() {
        return Err(NnDescentError::GraphError("No vectors provided".to_string()));
    }
    let dim = data[0].len();
    for (i, v) in data.iter().enumerate() {
        if v.len() != dim {
            return Err(NnDescentError::InvalidDimension {
                point: i,
                expected: dim,
                found: v.len(),
            });
        }
    }

    let n = data.len();
    let mut heap = NeighborHeap::new(n, n_neighbors);
    for i in 0..n {
        for j in rejection_sample(n_neighbors, n, rng)? {
            if j == i {
                continue;
            }
            let d = dist.eval(&data[i], &data[j]);
            heap.push(i, d, j as i32, true);
        }
    }

    debug!(
        "initialized random graph: {} points, {} neighbors, dim {}",
        n, n_neighbors, dim
    );
    Ok(heap)
}

// sorted k-NN graph

/// Metadata stored at the head of a graph file
#[derive(Serialize, Deserialize, Debug)]
struct GraphMetadata {
    version: u32,
    n_points: usize,
    k: usize,
    indices_offset: u64,
    distances_offset: u64,
}

/// Publishable k-NN graph: per point, `k` `(index, distance)` pairs in
/// ascending distance. Unfilled slots trail as `(EMPTY_INDEX, +inf)`.
#[derive(Clone, Debug, PartialEq)]
pub struct KnnGraph {
    /// Number of points (rows)
    pub n_points: usize,
    /// Slots per point
    pub k: usize,
    indices: Vec<i32>,
    distances: Vec<f32>,
}

impl KnnGraph {
    pub fn indices(&self, point: usize) -> &[i32] {
        &self.indices[point * self.k..(point + 1) * self.k]
    }

    pub fn distances(&self, point: usize) -> &[f32] {
        &self.distances[point * self.k..(point + 1) * self.k]
    }

    /// `(index, distance)` pairs of `point`, nearest first, unfilled slots skipped.
    pub fn neighbors(&self, point: usize) -> impl Iterator<Item = (i32, f32)> + '_ {
        self.indices(point)
            .iter()
            .copied()
            .zip(self.distances(point).iter().copied())
            .filter(|&(idx, _)| idx != EMPTY_INDEX)
    }

    /// Write the graph to a single file (layout in the crate docs).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), NnDescentError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        // bincode's fixed-width integers keep the metadata length independent of the offsets
        let mut metadata = GraphMetadata {
            version: GRAPH_FORMAT_VERSION,
            n_points: self.n_points,
            k: self.k,
            indices_offset: 0,
            distances_offset: 0,
        };
        let header_len = 8 + bincode::serialized_size(&metadata)?;
        let plane_bytes = (self.indices.len() * std::mem::size_of::<i32>()) as u64;
        metadata.indices_offset = header_len.div_ceil(GRAPH_DATA_ALIGN) * GRAPH_DATA_ALIGN;
        metadata.distances_offset = metadata.indices_offset + plane_bytes;

        let md_bytes = bincode::serialize(&metadata)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(md_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&md_bytes)?;

        file.seek(SeekFrom::Start(metadata.indices_offset))?;
        file.write_all(bytemuck::cast_slice::<i32, u8>(&self.indices))?;
        file.write_all(bytemuck::cast_slice::<f32, u8>(&self.distances))?;
        file.sync_all()?;

        debug!(
            "saved k-NN graph ({} points, k={}) to {}",
            self.n_points,
            self.k,
            path.display()
        );
        Ok(())
    }

    /// Open a graph written by [`KnnGraph::save`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NnDescentError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(false).open(path)?;
        let file_len = file.metadata()?.len();

        // Read metadata length
        let mut buf8 = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf8)?;
        let md_len = u64::from_le_bytes(buf8);
        if md_len > file_len.saturating_sub(8) {
            return Err(NnDescentError::GraphError(format!(
                "metadata length {} exceeds file length {}",
                md_len, file_len
            )));
        }

        let mut md_bytes = vec![0u8; md_len as usize];
        file.read_exact(&mut md_bytes)?;
        let metadata: GraphMetadata = bincode::deserialize(&md_bytes)?;
        if metadata.version != GRAPH_FORMAT_VERSION {
            return Err(NnDescentError::GraphError(format!(
                "unsupported graph format version {} (expected {})",
                metadata.version, GRAPH_FORMAT_VERSION
            )));
        }

        let plane_bytes = metadata
            .n_points
            .checked_mul(metadata.k)
            .and_then(|len| len.checked_mul(std::mem::size_of::<i32>()))
            .ok_or_else(|| {
                NnDescentError::GraphError(format!(
                    "graph shape {} x {} overflows",
                    metadata.n_points, metadata.k
                ))
            })? as u64;
        let plane_end = |offset: u64, name: &str| {
            offset.checked_add(plane_bytes).ok_or_else(|| {
                NnDescentError::GraphError(format!(
                    "{} plane at offset {} with {} bytes overflows",
                    name, offset, plane_bytes
                ))
            })
        };
        let indices_end = plane_end(metadata.indices_offset, "index")?;
        let distances_end = plane_end(metadata.distances_offset, "distance")?;
        // checked ends cannot precede their offsets, so these bounds order all four
        if metadata.indices_offset < 8 + md_len
            || indices_end > metadata.distances_offset
            || distances_end > file_len
        {
            return Err(NnDescentError::GraphError(format!(
                "graph planes [{}, {}) and [{}, {}) do not fit a {} byte file",
                metadata.indices_offset,
                indices_end,
                metadata.distances_offset,
                distances_end,
                file_len
            )));
        }
        if distances_end < file_len {
            warn!(
                "{} has {} trailing bytes after the distance plane",
                path.display(),
                file_len - distances_end
            );
        }

        let mmap = unsafe { Mmap::map(&file)? };
        let indices: &[i32] = bytemuck::try_cast_slice(
            &mmap[metadata.indices_offset as usize..indices_end as usize],
        )
        .map_err(|e| NnDescentError::GraphError(format!("index plane: {e}")))?;
        let distances: &[f32] = bytemuck::try_cast_slice(
            &mmap[metadata.distances_offset as usize..distances_end as usize],
        )
        .map_err(|e| NnDescentError::GraphError(format!("distance plane: {e}")))?;

        debug!(
            "opened k-NN graph ({} points, k={}) from {}",
            metadata.n_points,
            metadata.k,
            path.display()
        );
        Ok(Self {
            n_points: metadata.n_points,
            k: metadata.k,
            indices: indices.to_vec(),
            distances: distances.to_vec(),
        })
    }
}
