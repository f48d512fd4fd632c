use std::sync::Arc;

use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    errors::GraphResult,
    factor_types::{factor::Factor, factor_data::FactorData, factor_type::FactorType},
    fg::{factor_graph::FactorGraph, observation::FactorGraphObservation},
    model::factor_graph_model::FactorGraphModel,
};

// Two binary variables with one pairwise and two unary data-independent factors.
// Energies: E(0,0) = 0.4, E(1,0) = 1.3, E(0,1) = 0.9, E(1,1) = 1.3.
pub fn simple_chain_graph() -> GraphResult<FactorGraph> {
    let pairwise = Arc::new(FactorType::new("pairwise", vec![2, 2], vec![0., 0.3, 0.2, 0.])?);
    let unary_0 = Arc::new(FactorType::new("unary_0", vec![2], vec![0.1, 0.7])?);
    let unary_1 = Arc::new(FactorType::new("unary_1", vec![2], vec![0.3, 0.6])?);

    let mut graph = FactorGraph::new(vec![2, 2]);
    graph
        .add_factor(Factor::independent(pairwise, vec![0, 1])?)?
        .add_factor(Factor::independent(unary_0, vec![0])?)?
        .add_factor(Factor::independent(unary_1, vec![1])?)?;
    graph.compute_energies()?;
    graph.connect_components();
    Ok(graph)
}

// Lowers E(0,0) and raises E(0,1), E(1,0) until E(0,0) + E(1,1) <= E(1,0) + E(0,1)
fn truncate_energy(table: &mut [f64; 4]) {
    let [a, c, b, d] = *table;
    if a + d > c + b {
        let delta = a + d - c - b;
        let third = delta / 3.;
        table[0] = a - third;
        table[1] = c + third;
        table[2] = b + (delta - 2. * third) + 0.0001;
    }
}

// n x n grid of binary variables with random unary energies and a spanning tree of
// submodular pairwise energies: the first column is connected vertically, every row
// extends horizontally from its first cell. Energies are given as data of weightless
// factor types.
pub fn random_chain_graph(n: usize, seed: u64) -> GraphResult<FactorGraph> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pairwise = Arc::new(FactorType::new("pairwise", vec![2, 2], Vec::new())?);
    let unary = Arc::new(FactorType::new("unary", vec![2], Vec::new())?);
    let index = |x: usize, y: usize| x + n * y;

    let mut graph = FactorGraph::with_capacity(vec![2; n * n], 2 * n * n);
    for variable in 0..n * n {
        let data: Vec<f64> = vec![rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)];
        graph.add_factor(Factor::new(unary.clone(), vec![variable], data.into())?)?;
    }

    for x in 0..n {
        for y in 0..n {
            let variables = if x > 0 {
                vec![index(x, y), index(x - 1, y)]
            } else if y > 0 {
                vec![index(x, y - 1), index(x, y)]
            } else {
                continue;
            };
            let mut table = [0.; 4];
            table.iter_mut().for_each(|energy| *energy = rng.gen_range(0.0..1.0));
            truncate_energy(&mut table);
            graph.add_factor(Factor::new(pairwise.clone(), variables, table.to_vec().into())?)?;
        }
    }

    graph.compute_energies()?;
    graph.connect_components();
    Ok(graph)
}

// Synthetic multi-label data: example k has label k % len_label switched on and
// 3 (i + 1) randomly chosen binary features set, i being its active label
pub fn multilabel_data(
    len_label: usize,
    len_feat: usize,
    size_data: usize,
    seed: u64,
) -> (Vec<Vec<f64>>, Vec<Vec<usize>>) {
    assert!(size_data > len_label, "Every label must occur in the data.");
    let mut rng = StdRng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(size_data);
    let mut labels = Vec::with_capacity(size_data);

    for k in 0..size_data {
        let active = k % len_label;
        let mut label = vec![0; len_label];
        label[active] = 1;

        let mut indices = (0..len_feat).collect::<Vec<_>>();
        indices.shuffle(&mut rng);
        let mut feature = vec![0.; len_feat];
        for &index in indices.iter().take(3 * (active + 1)) {
            feature[index] = 1.;
        }

        features.push(feature);
        labels.push(label);
    }
    (features, labels)
}

// Every unordered pair of labels, in lexicographic order
pub fn full_edges(num_labels: usize) -> Vec<(usize, usize)> {
    (0..num_labels)
        .flat_map(|i| (i + 1..num_labels).map(move |j| (i, j)))
        .collect()
}

// Model over the given multi-label data: one unary type per label (weights over the
// features of every state) and one pairwise type per edge of the fully connected label
// graph (a constant feature)
pub fn build_multilabel_model(
    features: &[Vec<f64>],
    labels: &[Vec<usize>],
) -> GraphResult<FactorGraphModel> {
    let num_labels = labels.first().map_or(0, |label| label.len());
    let dim = features.first().map_or(0, |feature| feature.len());
    let edges = full_edges(num_labels);

    let unary_types = (0..num_labels)
        .map(|u| FactorType::with_data_size(&format!("unary_{}", u), vec![2], dim).map(Arc::new))
        .collect::<GraphResult<Vec<_>>>()?;
    let edge_types = (0..edges.len())
        .map(|t| FactorType::with_data_size(&format!("edge_{}", t), vec![2, 2], 1).map(Arc::new))
        .collect::<GraphResult<Vec<_>>>()?;

    let mut model = FactorGraphModel::new();
    for ftype in unary_types.iter().chain(edge_types.iter()) {
        model.add_factor_type(ftype.clone())?;
    }

    for (feature, label) in features.iter().zip(labels.iter()) {
        let shared: Arc<[f64]> = feature.clone().into();
        let mut graph = FactorGraph::with_capacity(vec![2; num_labels], num_labels + edges.len());
        for (u, ftype) in unary_types.iter().enumerate() {
            graph.add_factor(Factor::new(ftype.clone(), vec![u], FactorData::Shared(shared.clone()))?)?;
        }
        for (&(i, j), ftype) in edges.iter().zip(edge_types.iter()) {
            graph.add_factor(Factor::new(ftype.clone(), vec![i, j], vec![1.].into())?)?;
        }
        model.add_example(graph, FactorGraphObservation::new(label.clone()))?;
    }

    debug!(
        "Built multi-label model with {} examples, {} labels and {} parameters",
        model.num_examples(),
        num_labels,
        model.dim()
    );
    Ok(model)
}

// Two one-variable examples that a unary model separates with margin:
// features (1, 0) have label 0, features (0, 1) have label 1
#[cfg(test)]
pub(crate) fn separable_unary_model() -> (FactorGraphModel, Vec<Vec<usize>>) {
    let unary = Arc::new(FactorType::with_data_size("unary", vec![2], 2).unwrap());
    let mut model = FactorGraphModel::new();
    model.add_factor_type(unary.clone()).unwrap();

    let labels = vec![vec![0], vec![1]];
    for (features, label) in [vec![1., 0.], vec![0., 1.]].into_iter().zip(labels.iter()) {
        let mut graph = FactorGraph::new(vec![2]);
        graph
            .add_factor(Factor::new(unary.clone(), vec![0], features.into()).unwrap())
            .unwrap();
        model
            .add_example(graph, FactorGraphObservation::new(label.clone()))
            .unwrap();
    }
    (model, labels)
}
