use std::time::Instant;

use log::{info, warn};

use crate::{
    errors::{TrainingError, TrainingResult},
    model::factor_graph_model::{ArgmaxOutcome, FactorGraphModel},
    solvers::solver::{
        squared_norm, IterationRecord, StructuredSolver, TrainingOptions, TrainingReport,
        TrainingStatus,
    },
};

// Batch Frank-Wolfe on the structured SVM dual.
// The iterate is kept in primal form: w and the loss term ℓ of the dual objective
// ℓ - λ/2 ||w||². Every iteration runs loss-augmented inference on all examples to get the
// corner (w_s, l_s) and moves towards it.
pub struct FwSosvm<'a> {
    model: &'a FactorGraphModel,
    w: Vec<f64>,
    loss: f64,
}

impl<'a> StructuredSolver<'a> for FwSosvm<'a> {
    fn init(model: &'a FactorGraphModel) -> TrainingResult<Self> {
        Ok(FwSosvm {
            model,
            w: vec![0.; model.dim()],
            loss: 0.,
        })
    }

    fn run(mut self, options: &TrainingOptions) -> TrainingResult<TrainingReport> {
        options.validate()?;
        let num_examples = self.model.num_examples();
        if num_examples == 0 {
            return Err(TrainingError::EmptyModel);
        }
        let time_start = Instant::now();
        let lambda = options.lambda();
        let dim = self.model.dim();

        let mut iteration = 0;
        let mut history = Vec::new();
        let mut skipped = Vec::new();
        let mut primal;
        let status;

        loop {
            iteration += 1;

            // Corner of the dual domain:
            //   w_s = Σ_i (ψ(x_i, y_i) - ψ(x_i, ŷ_i)) / (λN), l_s = Σ_i Δ_i / N
            self.model.w_to_fparams(&self.w)?;
            let mut w_s = vec![0.; dim];
            let mut l_s = 0.;
            let mut skipped_now = 0;
            let scale = 1. / (lambda * num_examples as f64);
            for outcome in self.model.argmax_all(&self.w, iteration, options)? {
                match outcome {
                    ArgmaxOutcome::Converged(result) => {
                        for ((w_k, truth), pred) in w_s
                            .iter_mut()
                            .zip(result.psi_truth.iter())
                            .zip(result.psi_pred.iter())
                        {
                            *w_k += scale * (truth - pred);
                        }
                        l_s += result.delta / num_examples as f64;
                    }
                    ArgmaxOutcome::Skipped(record) => {
                        skipped_now += 1;
                        skipped.push(record);
                    }
                }
            }

            // Duality gap λ <w - w_s, w> - ℓ + l_s
            let w_dot_w_s = self.w.iter().zip(w_s.iter()).map(|(a, b)| a * b).sum::<f64>();
            let w_norm = squared_norm(&self.w);
            let gap = lambda * (w_norm - w_dot_w_s) - self.loss + l_s;
            primal = 0.5 * lambda * w_norm + l_s - lambda * w_dot_w_s;
            let dual = self.loss - 0.5 * lambda * w_norm;

            let elapsed_time = time_start.elapsed();
            info!(
                "Iteration {}. Elapsed time {:?}. Primal {}. Dual {}. Duality gap {}.",
                iteration, elapsed_time, primal, dual, gap
            );

            // Break if a stopping condition is satisfied.
            // The gap is only exact if every example contributed to the corner.
            if gap <= options.gap_threshold() && skipped_now > 0 {
                warn!(
                    "Duality gap below threshold with {} skipped examples. Continuing.",
                    skipped_now
                );
            }
            if gap <= options.gap_threshold() && skipped_now == 0 {
                history.push(IterationRecord {
                    iteration,
                    primal,
                    dual,
                    w_distance: 0.,
                });
                info!("Duality gap below threshold. Interrupting.");
                status = TrainingStatus::Converged;
                break;
            }

            let direction_norm = self
                .w
                .iter()
                .zip(w_s.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>();
            let gamma = if !options.line_search() {
                2. / (iteration as f64 + 1.)
            } else if direction_norm > 0. {
                (gap / (lambda * direction_norm)).clamp(0., 1.)
            } else {
                1.
            };

            for (w_k, s_k) in self.w.iter_mut().zip(w_s.iter()) {
                *w_k = (1. - gamma) * *w_k + gamma * s_k;
            }
            self.loss = (1. - gamma) * self.loss + gamma * l_s;
            history.push(IterationRecord {
                iteration,
                primal,
                dual,
                w_distance: gamma * direction_norm.sqrt(),
            });

            if iteration >= options.max_iterations() {
                info!("Maximum number of iterations reached. Interrupting.");
                status = TrainingStatus::IterationLimit;
                break;
            }

            if elapsed_time >= options.time_max() {
                info!("Time limit reached. Interrupting.");
                status = TrainingStatus::TimeLimit;
                break;
            }
        }

        info!(
            "Frank-Wolfe finished. Elapsed time {:?}. Primal objective {}. Skipped examples {}.",
            time_start.elapsed(),
            primal,
            skipped.len()
        );

        Ok(TrainingReport {
            w: self.w,
            iterations: iteration,
            status,
            primal_objective: primal,
            history,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::{
        fg::data_generator::{build_multilabel_model, multilabel_data, separable_unary_model},
        inference::map_inference::InferenceOptions,
        solvers::sosvm_helper::average_loss,
    };

    use super::*;

    #[test]
    fn separable_data_is_fitted() {
        let (model, labels) = separable_unary_model();
        let mut options = TrainingOptions::default();
        options.set_lambda(0.01).set_max_iterations(50);

        let report = FwSosvm::init(&model).unwrap().run(&options).unwrap();
        assert!(report.is_converged());
        assert_eq!(report.iterations, 2);
        // the first step with exact line search lands on the optimum
        for (w_k, expected) in report.w.iter().zip([-0.5, 0.5, 0.5, -0.5]) {
            assert_abs_diff_eq!(*w_k, expected, epsilon = 1e-9);
        }
        assert_eq!(model.predict(&report.w, &InferenceOptions::default()).unwrap(), labels);
        assert_abs_diff_eq!(report.primal_objective, 0.005, epsilon = 1e-9);
    }

    #[test]
    fn line_search_keeps_the_dual_monotone() {
        let (features, labels) = multilabel_data(3, 9, 6, 4);
        let model = build_multilabel_model(&features, &labels).unwrap();
        let mut options = TrainingOptions::default();
        options.set_lambda(0.1).set_max_iterations(15);

        let report = FwSosvm::init(&model).unwrap().run(&options).unwrap();
        assert_eq!(report.history.len(), report.iterations);
        assert_eq!(report.history[0].dual, 0.);
        for pair in report.history.windows(2) {
            assert!(pair[1].dual >= pair[0].dual - 1e-9);
        }
    }

    #[test]
    fn multilabel_training_set_is_fitted() {
        let (features, labels) = multilabel_data(4, 12, 8, 10);
        let model = build_multilabel_model(&features, &labels).unwrap();
        let mut options = TrainingOptions::default();
        options.set_lambda(0.01).set_max_iterations(200).set_parallel(true);

        let report = FwSosvm::init(&model).unwrap().run(&options).unwrap();
        let inference = InferenceOptions::default();
        assert_eq!(average_loss(&report.w, &model, &inference).unwrap(), 0.);
    }

    #[test]
    fn empty_model_is_rejected() {
        let model = FactorGraphModel::new();
        assert!(matches!(
            FwSosvm::init(&model).unwrap().run(&TrainingOptions::default()),
            Err(TrainingError::EmptyModel)
        ));
    }

    #[test]
    fn fixed_step_schedule() {
        let (model, _) = separable_unary_model();
        let mut options = TrainingOptions::default();
        options.set_line_search(false).set_max_iterations(1);

        // γ = 2 / (k + 1) is a full step into the first corner
        let report = FwSosvm::init(&model).unwrap().run(&options).unwrap();
        assert_eq!(report.status, TrainingStatus::IterationLimit);
        for (w_k, expected) in report.w.iter().zip([-50., 50., 50., -50.]) {
            assert_abs_diff_eq!(*w_k, expected, epsilon = 1e-9);
        }
    }
}
