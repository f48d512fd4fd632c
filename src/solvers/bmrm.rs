use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, Axis};

use crate::{
    errors::TrainingResult,
    model::factor_graph_model::FactorGraphModel,
    solvers::{
        qp_simplex::solve_simplex_qp,
        solver::{
            distance, squared_norm, IterationRecord, StructuredSolver, TrainingOptions,
            TrainingReport, TrainingStatus,
        },
    },
};

const QP_TOLERANCE: f64 = 1e-10;
const QP_MAX_ITERATIONS: usize = 100000;
const ACTIVE_THRESHOLD: f64 = 1e-12;

// Linear lower bound R(w) >= <a, w> + b collected at one iterate
#[derive(Debug, Clone)]
struct CuttingPlane {
    a: Vec<f64>,
    b: f64,
    idle: usize, // consecutive iterations with zero weight in the reduced problem
}

// Bundle method for regularized risk minimization:
//   min_w λ/2 ||w||² + R(w)
// R is approximated from below by cutting planes at the visited iterates; every iteration
// solves the dual of the approximated problem, a QP over the simplex, and adds the plane at
// its solution.
pub struct DualLibQpBmrm<'a> {
    model: &'a FactorGraphModel,
    planes: Vec<CuttingPlane>,
    gram: Array2<f64>,   // <a_i, a_j> over the current planes
    alpha: Array1<f64>,  // QP solution, warm start for the next iteration
}

impl<'a> DualLibQpBmrm<'a> {
    fn add_plane(&mut self, a: Vec<f64>, b: f64) {
        let n = self.planes.len();
        let mut gram = Array2::zeros((n + 1, n + 1));
        gram.slice_mut(s![..n, ..n]).assign(&self.gram);
        let a_view = ArrayView1::from(&a[..]);
        for (k, plane) in self.planes.iter().enumerate() {
            let product = a_view.dot(&ArrayView1::from(&plane.a[..]));
            gram[[k, n]] = product;
            gram[[n, k]] = product;
        }
        gram[[n, n]] = a_view.dot(&a_view);
        self.gram = gram;

        let mut alpha = Array1::zeros(n + 1);
        alpha.slice_mut(s![..n]).assign(&self.alpha);
        self.alpha = alpha;
        self.planes.push(CuttingPlane { a, b, idle: 0 });
    }

    // Drops planes that stayed inactive for `clean_after` iterations, except the newest
    fn remove_inactive_planes(&mut self, clean_after: usize) {
        let newest = self.planes.len() - 1;
        let keep = (0..self.planes.len())
            .filter(|&k| k == newest || self.planes[k].idle < clean_after)
            .collect::<Vec<_>>();
        if keep.len() == self.planes.len() {
            return;
        }
        debug!(
            "Removing {} inactive cutting planes",
            self.planes.len() - keep.len()
        );

        self.gram = self.gram.select(Axis(0), &keep).select(Axis(1), &keep);
        let mut alpha = self.alpha.select(Axis(0), &keep);
        let total = alpha.sum();
        if total > 0. {
            alpha /= total;
        }
        self.alpha = alpha;
        let mut index = 0;
        self.planes.retain(|_| {
            let kept = keep.binary_search(&index).is_ok();
            index += 1;
            kept
        });
    }

    // w = -1/λ Σ_k α_k a_k
    fn weights_from_alpha(&self, lambda: f64, dim: usize) -> Vec<f64> {
        let mut w = vec![0.; dim];
        for (plane, &alpha) in self.planes.iter().zip(self.alpha.iter()) {
            if alpha > 0. {
                for (w_k, a_k) in w.iter_mut().zip(plane.a.iter()) {
                    *w_k -= alpha * a_k / lambda;
                }
            }
        }
        w
    }
}

impl<'a> StructuredSolver<'a> for DualLibQpBmrm<'a> {
    fn init(model: &'a FactorGraphModel) -> TrainingResult<Self> {
        Ok(DualLibQpBmrm {
            model,
            planes: Vec::new(),
            gram: Array2::zeros((0, 0)),
            alpha: Array1::zeros(0),
        })
    }

    fn run(mut self, options: &TrainingOptions) -> TrainingResult<TrainingReport> {
        options.validate()?;
        let time_start = Instant::now();
        let lambda = options.lambda();
        let dim = self.model.dim();

        let mut w = vec![0.; dim];
        let mut iteration = 0;
        let mut history = Vec::new();
        let mut skipped = Vec::new();

        let risk = self.model.risk(&w, iteration, options)?;
        skipped.extend(risk.skipped.iter().copied());
        let b = risk.value - ArrayView1::from(&risk.subgradient[..]).dot(&ArrayView1::from(&w[..]));
        self.add_plane(risk.subgradient, b);
        let mut primal;
        let status;

        loop {
            iteration += 1;

            // Solve the reduced problem: min_α 1/(2λ) α'Gα - b'α over the simplex
            let h = &self.gram / lambda;
            let f = self.planes.iter().map(|plane| -plane.b).collect::<Array1<f64>>();
            let qp = solve_simplex_qp(&h, f.view(), Some(&self.alpha), QP_TOLERANCE, QP_MAX_ITERATIONS);
            if !qp.converged {
                warn!("Reduced problem not solved to tolerance in iteration {}", iteration);
            }
            let dual = -qp.value;
            self.alpha = qp.x;
            for (plane, &alpha) in self.planes.iter_mut().zip(self.alpha.iter()) {
                plane.idle = if alpha > ACTIVE_THRESHOLD { 0 } else { plane.idle + 1 };
            }

            let w_previous = w;
            w = self.weights_from_alpha(lambda, dim);
            let w_distance = distance(&w, &w_previous);

            let risk = self.model.risk(&w, iteration, options)?;
            skipped.extend(risk.skipped.iter().copied());
            primal = risk.value + 0.5 * lambda * squared_norm(&w);
            history.push(IterationRecord {
                iteration,
                primal,
                dual,
                w_distance,
            });

            let elapsed_time = time_start.elapsed();
            info!(
                "Iteration {}. Elapsed time {:?}. Primal {}. Dual {}. Cutting planes {}.",
                iteration,
                elapsed_time,
                primal,
                dual,
                self.planes.len()
            );

            // Break if a stopping condition is satisfied.
            // The gap only certifies w if no example was left out of the risk.
            let gap_closed = primal - dual <= options.tol_rel() * primal.abs()
                || primal - dual <= options.tol_abs();
            if gap_closed && risk.skipped.is_empty() {
                info!("Duality gap below tolerance. Interrupting.");
                status = TrainingStatus::Converged;
                break;
            }
            if gap_closed {
                warn!(
                    "Duality gap below tolerance with {} skipped examples. Continuing.",
                    risk.skipped.len()
                );
            }

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

            if options.clean_icp() {
                self.remove_inactive_planes(options.clean_after());
            }
            if self.planes.len() >= options.buffer_size() {
                warn!("Cutting plane buffer is full. Interrupting.");
                status = TrainingStatus::BufferFull;
                break;
            }

            let b = risk.value
                - ArrayView1::from(&risk.subgradient[..]).dot(&ArrayView1::from(&w[..]));
            self.add_plane(risk.subgradient, b);
        }

        info!(
            "BMRM finished. Elapsed time {:?}. Primal objective {}. Skipped examples {}.",
            time_start.elapsed(),
            primal,
            skipped.len()
        );

        Ok(TrainingReport {
            w,
            iterations: iteration,
            status,
            primal_objective: primal,
            history,
            skipped,
        })
    }
}
