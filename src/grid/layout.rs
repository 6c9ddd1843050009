//! Rank-grid factorization heuristic.
//!
//! The domain is split into a block grid of ranks whose per-axis counts
//! multiply to the total rank count. Among all factorizations the one
//! closest (least squares) to the load-balanced split proportional to the
//! domain extents is chosen.

fn factorizations_2d(n: usize) -> Vec<[usize; 3]> {
    (1..=n)
        .filter(|nx| n % nx == 0)
        .map(|nx| [nx, n / nx, 1])
        .collect()
}

fn factorizations_3d(n: usize) -> Vec<[usize; 3]> {
    let mut configurations = Vec::new();
    for nx in (1..=n).filter(|nx| n % nx == 0) {
        let nyz = n / nx;
        for ny in (1..=nyz).filter(|ny| nyz % ny == 0) {
            configurations.push([nx, ny, nyz / ny]);
        }
    }
    configurations
}

/// Choose the per-axis rank counts for `n_ranks` over a domain with the
/// given extents (one entry per spatial dimension).
pub fn rank_layout(n_ranks: usize, extents: &[f64]) -> [usize; 3] {
    let dim = extents.len();
    if dim <= 1 || n_ranks == 1 {
        let mut layout = [1, 1, 1];
        layout[0] = n_ranks;
        return layout;
    }

    let total: f64 = extents.iter().sum();
    let mut optimal = [0.0f64; 3];
    for d in 0..dim {
        optimal[d] = n_ranks as f64 * extents[d] / total;
    }

    let configurations = if dim == 2 {
        factorizations_2d(n_ranks)
    } else {
        factorizations_3d(n_ranks)
    };

    let mut best = configurations[0];
    let mut best_sigma = f64::MAX;
    for config in configurations {
        let sigma: f64 = (0..dim)
            .map(|d| (config[d] as f64 - optimal[d]).powi(2))
            .sum::<f64>()
            .sqrt();
        if sigma < best_sigma {
            best_sigma = sigma;
            best = config;
        }
    }
    best
}
