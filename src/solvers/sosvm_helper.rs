use crate::{
    errors::{TrainingError, TrainingResult},
    inference::map_inference::InferenceOptions,
    model::factor_graph_model::FactorGraphModel,
    solvers::solver::{squared_norm, TrainingOptions},
};

// λ/2 ||w||² + R(w)
pub fn primal_objective(
    w: &[f64],
    model: &FactorGraphModel,
    options: &TrainingOptions,
) -> TrainingResult<f64> {
    let risk = model.risk(w, 0, options)?;
    Ok(0.5 * options.lambda() * squared_norm(w) + risk.value)
}

// Mean loss of the predictions against the ground truth over all examples
pub fn average_loss(
    w: &[f64],
    model: &FactorGraphModel,
    options: &InferenceOptions,
) -> TrainingResult<f64> {
    if model.num_examples() == 0 {
        return Err(TrainingError::EmptyModel);
    }
    let predictions = model.predict(w, options)?;
    let mut total = 0.;
    for (example, prediction) in predictions.iter().enumerate() {
        total += model.delta_loss(example, prediction)?;
    }
    Ok(total / model.num_examples() as f64)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::fg::data_generator::separable_unary_model;

    use super::*;

    #[test]
    fn objective_of_separating_weights() {
        let (model, _) = separable_unary_model();
        let options = TrainingOptions::default();

        // zero weights: every example is a margin violation
        assert_abs_diff_eq!(primal_objective(&[0.; 4], &model, &options).unwrap(), 1.);

        // margin exactly one on both examples, so only the regularizer remains
        let w = [-0.5, 0.5, 0.5, -0.5];
        assert_abs_diff_eq!(
            primal_objective(&w, &model, &options).unwrap(),
            0.5 * 0.01 * 1.,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(average_loss(&w, &model, &InferenceOptions::default()).unwrap(), 0.);

        let flipped = [0.5, -0.5, -0.5, 0.5];
        assert_abs_diff_eq!(
            average_loss(&flipped, &model, &InferenceOptions::default()).unwrap(),
            1.
        );
    }

    #[test]
    fn empty_model_has_no_loss() {
        assert!(matches!(
            average_loss(&[], &FactorGraphModel::new(), &InferenceOptions::default()),
            Err(TrainingError::EmptyModel)
        ));
    }
}
