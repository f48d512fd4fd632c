use ndarray::{Array1, Array2, ArrayView1};

// Solution of a quadratic program over the probability simplex
#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: Array1<f64>,
    pub value: f64,       // 0.5 x'Hx + f'x
    pub iterations: usize,
    pub converged: bool,
}

// Minimizes 0.5 x'Hx + f'x subject to x >= 0 and Σx = 1.
//
// Sequential minimal optimization: every step moves mass from the coordinate with the largest
// gradient among those with x > 0 to the coordinate with the smallest gradient, with an exact
// line search along that direction. Stops when the gradient spread over the support is below
// `tol`. `x0` is used as the starting point when it is feasible.
pub fn solve_simplex_qp(
    h: &Array2<f64>,
    f: ArrayView1<f64>,
    x0: Option<&Array1<f64>>,
    tol: f64,
    max_iterations: usize,
) -> QpSolution {
    let n = f.len();
    assert_eq!(h.dim(), (n, n), "QP matrix doesn't match the linear term.");
    assert!(n > 0, "QP over an empty simplex.");

    let mut x = match x0 {
        Some(x0) if x0.len() == n && x0.iter().all(|&v| v >= 0.) && (x0.sum() - 1.).abs() < 1e-9 => {
            x0.clone()
        }
        _ => {
            // start from the vertex with the smallest objective
            let best = (0..n)
                .min_by(|&a, &b| (0.5 * h[[a, a]] + f[a]).total_cmp(&(0.5 * h[[b, b]] + f[b])))
                .unwrap_or(0);
            let mut x = Array1::zeros(n);
            x[best] = 1.;
            x
        }
    };

    let mut gradient = h.dot(&x) + &f;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        let mut up = 0; // smallest gradient
        let mut down = None; // largest gradient on the support
        for k in 0..n {
            if gradient[k] < gradient[up] {
                up = k;
            }
            if x[k] > 0. && down.map_or(true, |d: usize| gradient[k] > gradient[d]) {
                down = Some(k);
            }
        }
        let down = match down {
            Some(down) => down,
            None => break,
        };

        let spread = gradient[down] - gradient[up];
        if spread <= tol {
            converged = true;
            break;
        }

        let curvature = h[[up, up]] + h[[down, down]] - 2. * h[[up, down]];
        let step = if curvature > 0. {
            (spread / curvature).min(x[down])
        } else {
            x[down]
        };

        x[up] += step;
        x[down] -= step;
        for k in 0..n {
            gradient[k] += step * (h[[k, up]] - h[[k, down]]);
        }
        iterations += 1;
    }

    let value = 0.5 * x.dot(&h.dot(&x)) + f.dot(&x);
    QpSolution {
        x,
        value,
        iterations,
        converged,
    }
}
