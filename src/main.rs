use std::{sync::Arc, time::Instant};

use log::info;
use structured_mplp::{
    errors::TrainingError,
    factor_types::{factor::Factor, factor_type::FactorType},
    fg::{
        data_generator::{build_multilabel_model, multilabel_data},
        factor_graph::FactorGraph,
    },
    inference::map_inference::{infer, InferenceMethod, InferenceOptions},
    model::factor_graph_model::FactorGraphModel,
    solvers::{
        bmrm::DualLibQpBmrm,
        fw_sosvm::FwSosvm,
        solver::{StructuredSolver, TrainingOptions, TrainingReport},
        sosvm_helper::average_loss,
        stochastic_sosvm::StochasticSosvm,
    },
};

// Three binary variables on a chain, both pairwise factors of one type with their own
// energy tables given as data
fn chain_of_three() -> Result<FactorGraph, TrainingError> {
    let ftype = Arc::new(FactorType::new("pairwise", vec![2, 2], Vec::new())?);
    let mut graph = FactorGraph::new(vec![2, 2, 2]);
    graph
        .add_factor(Factor::new(ftype.clone(), vec![0, 1], vec![0.3, 0.5, 1.0, 0.2].into())?)?
        .add_factor(Factor::new(ftype, vec![1, 2], vec![0.05, 0.6, -0.2, 0.75].into())?)?;
    graph.compute_energies()?;
    graph.connect_components();
    Ok(graph)
}

fn report_training(
    name: &str,
    model: &FactorGraphModel,
    report: &TrainingReport,
    options: &TrainingOptions,
) -> Result<(), TrainingError> {
    let loss = average_loss(&report.w, model, options.inference())?;
    info!(
        "{} finished after {} iterations with status {:?}. Primal objective {}. Training loss {}. Skipped examples {}.",
        name,
        report.iterations,
        report.status,
        report.primal_objective,
        loss,
        report.skipped.len()
    );
    Ok(())
}

fn main() -> Result<(), TrainingError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let graph = chain_of_three()?;
    for method in [InferenceMethod::TreeMaxProduct, InferenceMethod::LpRelaxation] {
        let mut options = InferenceOptions::default();
        options.set_method(method);
        let time_start = Instant::now();
        let solution = infer(&graph, &options)?;
        info!(
            "{:?}: assignment {:?}, energy {}, status {:?}. Elapsed time {:?}.",
            method,
            solution.assignment,
            solution.energy,
            solution.status,
            time_start.elapsed()
        );
    }

    let (features, labels) = multilabel_data(4, 12, 8, 10);
    let model = build_multilabel_model(&features, &labels)?;
    info!(
        "Multi-label model with {} examples and {} parameters.",
        model.num_examples(),
        model.dim()
    );

    let mut options = TrainingOptions::default();
    options.set_lambda(0.01).set_max_iterations(50);
    let report = DualLibQpBmrm::init(&model)?.run(&options)?;
    report_training("BMRM", &model, &report, &options)?;

    let mut options = TrainingOptions::default();
    options
        .set_lambda(0.0001)
        .set_max_iterations(150)
        .set_weighted_averaging(true)
        .set_objective_period(50);
    let report = StochasticSosvm::init(&model)?.run(&options)?;
    report_training("Stochastic subgradient", &model, &report, &options)?;

    let mut options = TrainingOptions::default();
    options.set_lambda(0.01).set_max_iterations(100).set_parallel(true);
    let report = FwSosvm::init(&model)?.run(&options)?;
    report_training("Frank-Wolfe", &model, &report, &options)?;

    Ok(())
}
