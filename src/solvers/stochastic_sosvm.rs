use std::time::Instant;

use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    errors::TrainingResult,
    model::factor_graph_model::{ArgmaxOutcome, FactorGraphModel},
    solvers::{
        solver::{
            distance, IterationRecord, NonConvergence, StructuredSolver, TrainingOptions,
            TrainingReport, TrainingStatus,
        },
        sosvm_helper::primal_objective,
    },
};

// Stochastic subgradient method for the structured SVM primal.
// Every step picks a random example, solves its loss-augmented inference and moves w
// towards w_s = (ψ(x_i, y_i) - ψ(x_i, ŷ_i)) / λ with step size 1 / (k + 1).
pub struct StochasticSosvm<'a> {
    model: &'a FactorGraphModel,
    w: Vec<f64>,
    w_avg: Vec<f64>,
    step: usize, // number of updates performed
}

impl<'a> StochasticSosvm<'a> {
    // One update with the subgradient of example `example`. Returns false if the example was
    // skipped because its inference did not converge.
    fn update(
        &mut self,
        example: usize,
        pass: usize,
        options: &TrainingOptions,
        skipped: &mut Vec<NonConvergence>,
    ) -> TrainingResult<bool> {
        let result = match self.model.argmax_checked(&self.w, example, pass, options)? {
            ArgmaxOutcome::Converged(result) => result,
            ArgmaxOutcome::Skipped(record) => {
                skipped.push(record);
                return Ok(false);
            }
        };

        let scale = 1. / options.lambda();
        let gamma = 1. / (self.step as f64 + 1.);
        for ((w_k, truth), pred) in self
            .w
            .iter_mut()
            .zip(result.psi_truth.iter())
            .zip(result.psi_pred.iter())
        {
            *w_k = (1. - gamma) * *w_k + gamma * scale * (truth - pred);
        }

        if options.weighted_averaging() {
            let rho = 2. / (self.step as f64 + 2.);
            for (avg, w_k) in self.w_avg.iter_mut().zip(self.w.iter()) {
                *avg = (1. - rho) * *avg + rho * w_k;
            }
        }
        self.step += 1;
        Ok(true)
    }

    fn weights(&self, options: &TrainingOptions) -> &[f64] {
        if options.weighted_averaging() {
            &self.w_avg
        } else {
            &self.w
        }
    }
}

impl<'a> StructuredSolver<'a> for StochasticSosvm<'a> {
    fn init(model: &'a FactorGraphModel) -> TrainingResult<Self> {
        Ok(StochasticSosvm {
            model,
            w: vec![0.; model.dim()],
            w_avg: vec![0.; model.dim()],
            step: 0,
        })
    }

    fn run(mut self, options: &TrainingOptions) -> TrainingResult<TrainingReport> {
        options.validate()?;
        let time_start = Instant::now();
        let num_examples = self.model.num_examples();
        let mut rng = StdRng::seed_from_u64(options.seed());

        let mut pass = 0;
        let mut history = Vec::new();
        let mut skipped = Vec::new();
        let mut previous_objective: Option<f64> = None;
        let mut w_last_check = self.w.clone();
        let status;

        loop {
            pass += 1;
            for _ in 0..num_examples {
                let example = rng.gen_range(0..num_examples);
                self.update(example, pass, options, &mut skipped)?;
            }

            let elapsed_time = time_start.elapsed();
            debug!(
                "Iteration {}. Elapsed time {:?}. Updates {}.",
                pass, elapsed_time, self.step
            );

            // Periodically evaluate the primal objective
            if options.objective_period() > 0 && pass % options.objective_period() == 0 {
                let w = self.weights(options);
                let primal = primal_objective(w, self.model, options)?;
                history.push(IterationRecord {
                    iteration: pass,
                    primal,
                    dual: f64::NEG_INFINITY,
                    w_distance: distance(w, &w_last_check),
                });
                w_last_check = w.to_vec();
                info!(
                    "Iteration {}. Elapsed time {:?}. Primal {}.",
                    pass, elapsed_time, primal
                );

                if let Some(previous) = previous_objective {
                    if (previous - primal).abs() <= options.tol_rel() * primal.abs() {
                        info!("Primal objective changed less than the tolerance. Interrupting.");
                        status = TrainingStatus::Converged;
                        break;
                    }
                }
                previous_objective = Some(primal);
            }

            // Break if a stopping condition is satisfied
            if pass >= options.max_iterations() {
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

        let w = self.weights(options).to_vec();
        let primal = primal_objective(&w, self.model, options)?;
        info!(
            "Stochastic subgradient finished. Elapsed time {:?}. Primal objective {}. Skipped examples {}.",
            time_start.elapsed(),
            primal,
            skipped.len()
        );

        Ok(TrainingReport {
            w,
            iterations: pass,
            status,
            primal_objective: primal,
            history,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        fg::data_generator::{build_multilabel_model, multilabel_data, separable_unary_model},
        inference::map_inference::InferenceOptions,
        solvers::sosvm_helper::average_loss,
    };

    use super::*;

    #[test]
    fn separable_data_is_fitted() {
        let (model, labels) = separable_unary_model();
        for averaging in [false, true] {
            let mut options = TrainingOptions::default();
            options
                .set_lambda(0.01)
                .set_max_iterations(20)
                .set_seed(3)
                .set_weighted_averaging(averaging);

            let report = StochasticSosvm::init(&model).unwrap().run(&options).unwrap();
            assert_eq!(report.iterations, 20);
            assert_eq!(report.status, TrainingStatus::IterationLimit);
            assert!(report.history.is_empty());
            assert_eq!(model.predict(&report.w, &InferenceOptions::default()).unwrap(), labels);
            assert_eq!(average_loss(&report.w, &model, &InferenceOptions::default()).unwrap(), 0.);
        }
    }

    #[test]
    fn weights_have_the_separating_sign_pattern() {
        let (model, _) = separable_unary_model();
        let mut options = TrainingOptions::default();
        options.set_max_iterations(10).set_seed(11);

        let w = StochasticSosvm::init(&model).unwrap().run(&options).unwrap().w;
        // updates only ever move along (-1, 0, 1, 0) and (0, 1, 0, -1)
        assert!(w[0] < 0. && w[2] > 0.);
        assert!(w[1] > 0. && w[3] < 0.);
        assert_eq!(w[0], -w[2]);
        assert_eq!(w[1], -w[3]);
    }

    #[test]
    fn runs_are_reproducible() {
        let (features, labels) = multilabel_data(3, 9, 6, 2);
        let model = build_multilabel_model(&features, &labels).unwrap();
        let mut options = TrainingOptions::default();
        options
            .set_lambda(0.1)
            .set_max_iterations(4)
            .set_objective_period(2)
            .set_tol_rel(0.);

        let first = StochasticSosvm::init(&model).unwrap().run(&options).unwrap();
        let second = StochasticSosvm::init(&model).unwrap().run(&options).unwrap();
        assert_eq!(first.w, second.w);
        assert_eq!(first.history.len(), 2);
        assert_eq!(first.history[1].iteration, 4);
        assert_eq!(first.history, second.history);
    }
}
