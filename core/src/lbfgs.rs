//! Limited-memory BFGS minimizer.
//!
//! Two-loop recursion over a ring-buffered `(s, y)` history, initial
//! Hessian scaling from the most recent curvature pair, and an Armijo
//! backtracking line search. Sized for the small dense problems of the
//! CRF trainer (hundreds of parameters); no external solver dependency is
//! warranted at that scale.

use tracing::{debug, info};

/// Minimizer options. `m` is clamped to [1, 32].
#[derive(Debug, Clone)]
pub struct LbfgsParams {
    pub max_iter: usize,
    /// History size.
    pub m: usize,
    /// Stop when the gradient norm drops below this.
    pub tol: f64,
    /// Maximum backtracking steps per line search.
    pub ls_max: usize,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            max_iter: 50,
            m: 8,
            tol: 1e-5,
            ls_max: 20,
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Minimize `eval` starting from `x`. `eval(x, g)` must fill `g` with the
/// gradient and return the objective value. Returns the final objective.
///
/// A non-descent two-loop direction or a non-positive curvature pair
/// resets the history and falls back to steepest descent; a failed line
/// search terminates early with the best point found.
pub fn minimize<F>(x: &mut [f64], params: &LbfgsParams, mut eval: F) -> f64
where
    F: FnMut(&[f64], &mut [f64]) -> f64,
{
    let n = x.len();
    if n == 0 {
        return 0.0;
    }
    let max_iter = params.max_iter.max(1);
    let m_hist = params.m.clamp(1, 32);
    let tol = if params.tol > 0.0 { params.tol } else { 1e-5 };
    let ls_max = params.ls_max.max(1);

    let mut g = vec![0.0; n];
    let mut g_new = vec![0.0; n];
    let mut x_new = vec![0.0; n];
    let mut d = vec![0.0; n];
    let mut q = vec![0.0; n];
    let mut alpha = vec![0.0; m_hist];
    let mut rho = vec![0.0; m_hist];
    let mut s_hist = vec![0.0; m_hist * n];
    let mut y_hist = vec![0.0; m_hist * n];

    let mut hist_count = 0usize;
    let mut hist_start = 0usize;

    let mut f = eval(x, &mut g);

    for it in 0..max_iter {
        let gnorm = norm2(&g);
        if gnorm < tol {
            info!(iter = it, grad_norm = gnorm, "L-BFGS converged");
            break;
        }

        // Two-loop recursion: d = -H g.
        q.copy_from_slice(&g);
        for i in (0..hist_count).rev() {
            let idx = (hist_start + i) % m_hist;
            let s = &s_hist[idx * n..(idx + 1) * n];
            let y = &y_hist[idx * n..(idx + 1) * n];
            let a = rho[idx] * dot(s, &q);
            alpha[i] = a;
            for (qj, yj) in q.iter_mut().zip(y) {
                *qj -= a * yj;
            }
        }

        let mut h0 = 1.0;
        if hist_count > 0 {
            let idx = (hist_start + hist_count - 1) % m_hist;
            let s = &s_hist[idx * n..(idx + 1) * n];
            let y = &y_hist[idx * n..(idx + 1) * n];
            let yy = dot(y, y);
            if yy > 0.0 {
                h0 = dot(s, y) / yy;
            }
        }

        for (dj, qj) in d.iter_mut().zip(&q) {
            *dj = h0 * qj;
        }
        for i in 0..hist_count {
            let idx = (hist_start + i) % m_hist;
            let s = &s_hist[idx * n..(idx + 1) * n];
            let y = &y_hist[idx * n..(idx + 1) * n];
            let b = rho[idx] * dot(y, &d);
            let a = alpha[i];
            for (dj, sj) in d.iter_mut().zip(s) {
                *dj += (a - b) * sj;
            }
        }
        for dj in d.iter_mut() {
            *dj = -*dj;
        }

        let mut gtd = dot(&g, &d);
        if !(gtd < 0.0) {
            // Not a descent direction: reset to steepest descent.
            for (dj, gj) in d.iter_mut().zip(&g) {
                *dj = -gj;
            }
            gtd = dot(&g, &d);
            hist_count = 0;
            hist_start = 0;
        }

        // Armijo backtracking.
        let c1 = 1e-4;
        let mut t = 1.0;
        let mut accepted = false;
        let mut f_new = f;
        for _ in 0..ls_max {
            for j in 0..n {
                x_new[j] = x[j] + t * d[j];
            }
            f_new = eval(&x_new, &mut g_new);
            if f_new <= f + c1 * t * gtd {
                accepted = true;
                break;
            }
            t *= 0.5;
            if t < 1e-20 {
                break;
            }
        }
        if !accepted {
            info!(iter = it, "L-BFGS line search failed; stopping");
            break;
        }

        // Store (s, y) = (x_new - x, g_new - g) in the ring.
        let store_idx = if hist_count < m_hist {
            let idx = (hist_start + hist_count) % m_hist;
            hist_count += 1;
            idx
        } else {
            let idx = hist_start;
            hist_start = (hist_start + 1) % m_hist;
            idx
        };
        {
            let s = &mut s_hist[store_idx * n..(store_idx + 1) * n];
            for j in 0..n {
                s[j] = x_new[j] - x[j];
            }
        }
        {
            let y = &mut y_hist[store_idx * n..(store_idx + 1) * n];
            for j in 0..n {
                y[j] = g_new[j] - g[j];
            }
        }
        let ys = dot(
            &y_hist[store_idx * n..(store_idx + 1) * n],
            &s_hist[store_idx * n..(store_idx + 1) * n],
        );
        if ys > 1e-12 {
            rho[store_idx] = 1.0 / ys;
        } else {
            // Numerically useless pair; drop the whole history.
            hist_count = 0;
            hist_start = 0;
        }

        x.copy_from_slice(&x_new);
        g.copy_from_slice(&g_new);
        f = f_new;

        debug!(
            iter = it + 1,
            objective = f,
            grad_norm = norm2(&g),
            step = t,
            "L-BFGS iteration"
        );
    }

    f
}
