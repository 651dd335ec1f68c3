// demos/nn_descent.rs
//
// A minimal NN-descent driver around the candidate-maintenance core:
// random init, a fixed number of candidate/local-join passes, then a sorted,
// persisted k-NN graph checked against brute force.
//
// RUST_LOG=debug cargo run --release --example nn_descent
use anndists::dist::DistL2; // swap to DistCosine, DistL1, etc. if desired
use anndists::prelude::Distance;
use log::info;
use rand::prelude::*;
use rust_nndescent::{
    build_candidates_with_params, init_random_graph, CandidateFilter, KnnGraph, NeighborHeap,
    NnDescentError, NnDescentParams,
};
use std::time::Instant;

const NUM_VECTORS: usize = 2_000;
const DIM: usize = 16;
const PASSES: usize = 8;
const RECALL_QUERIES: usize = 100;

/// Compare every candidate pair of every row and push improvements back into `graph`.
fn local_join<D: Distance<f32>>(
    data: &[Vec<f32>],
    graph: &mut NeighborHeap,
    candidates: &NeighborHeap,
    dist: &D,
) -> usize {
    let mut updates = 0;
    for row in 0..candidates.n_points() {
        let pool: Vec<i32> = candidates
            .indices(row)
            .iter()
            .copied()
            .filter(|&i| i >= 0)
            .collect();
        for (a, &p) in pool.iter().enumerate() {
            for &q in &pool[a + 1..] {
                let d = dist.eval(&data[p as usize], &data[q as usize]);
                updates += graph.push(p as usize, d, q, true) as usize;
                updates += graph.push(q as usize, d, p, true) as usize;
            }
        }
    }
    updates
}

fn brute_force(data: &[Vec<f32>], point: usize, k: usize) -> Vec<i32> {
    let mut all: Vec<(f32, i32)> = data
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != point)
        .map(|(j, v)| (DistL2.eval(&data[point], v), j as i32))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0));
    all.into_iter().take(k).map(|(_, j)| j).collect()
}

fn main() -> Result<(), NnDescentError> {
    env_logger::init();

    let params = NnDescentParams {
        n_neighbors: 10,
        max_candidates: 20,
        candidate_filter: CandidateFilter::NewEdges,
        ..Default::default()
    };
    println!("Params: {params:?}");

    println!("Generating {NUM_VECTORS} sample vectors of dimension {DIM}...");
    let mut rng = StdRng::seed_from_u64(params.seed);
    let data: Vec<Vec<f32>> = (0..NUM_VECTORS)
        .map(|_| (0..DIM).map(|_| rng.r#gen::<f32>()).collect())
        .collect();

    let start = Instant::now();
    let mut tau = params.rng();
    let mut graph = init_random_graph(&data, params.n_neighbors, DistL2, &mut tau)?;

    for pass in 0..PASSES {
        let candidates = build_candidates_with_params(&mut graph, &params, &mut tau)?;
        let updates = local_join(&data, &mut graph, &candidates, &DistL2);
        info!("pass {pass}: {updates} heap updates");
        println!("pass {pass}: {updates} updates");
    }

    let knn = graph.into_sorted_graph();
    println!("Built k-NN graph in {:.2?}", start.elapsed());

    let path = std::env::temp_dir().join("nn_descent_demo.graph");
    knn.save(&path)?;
    let knn = KnnGraph::open(&path)?;
    println!("Saved and reopened {}", path.display());

    let mut hits = 0usize;
    for point in 0..RECALL_QUERIES {
        let truth = brute_force(&data, point, knn.k);
        hits += knn
            .neighbors(point)
            .filter(|(idx, _)| truth.contains(idx))
            .count();
    }
    println!(
        "recall@{}: {:.3}",
        knn.k,
        hits as f32 / (RECALL_QUERIES * knn.k) as f32
    );

    let _ = std::fs::remove_file(&path);
    Ok(())
}
