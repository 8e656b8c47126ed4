use gauge::als::{AlsSolver, SolverConfig};
use gauge::dimension::{DimensionSelector, Homogenize, SearchConfig, SearchMode, homogenize};
use gauge::progress::{SolverProgressObserver, SolverStage};
use gauge::types::{Facet, ObservationMatrix};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// 50 x 20 matrix with a two-dimensional structure plus N(0, `noise_sd`) noise.
fn rank_two(seed: u64, noise_sd: f64) -> ObservationMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let unit = Normal::new(0.0, 1.0).unwrap();
    let rows = Array2::from_shape_fn((50, 2), |_| unit.sample(&mut rng));
    let cols = Array2::from_shape_fn((20, 2), |_| unit.sample(&mut rng));
    let mut values = rows.dot(&cols.t());
    if noise_sd > 0.0 {
        values.mapv_inplace(|v| v + noise_sd * unit.sample(&mut rng));
    }
    ObservationMatrix::from_values(values).unwrap()
}

fn noisy_rank_two(seed: u64) -> ObservationMatrix {
    rank_two(seed, 0.3)
}

fn solver() -> SolverConfig {
    SolverConfig {
        tolerance: 1e-7,
        max_sweeps: 300,
        ..SolverConfig::default()
    }
}

#[test]
fn brute_force_recovers_two_dimensions() {
    let matrix = noisy_rank_two(17);
    let search = SearchConfig {
        candidates: vec![1, 2, 3],
        ..SearchConfig::default()
    };
    let solver = solver();
    let result = DimensionSelector::new(&search, &solver).run(&matrix).unwrap();

    assert_eq!(result.ndim, 2, "{:#?}", result.table);
    assert_eq!(result.table.len(), 3);
    let at = |d: usize| result.stats_for(d).and_then(|row| row.objectivity).unwrap();
    assert!(at(2) > at(1), "{:#?}", result.table);
    assert!(at(2) > at(3), "{:#?}", result.table);
    assert!(result.objectivity_confirmed);
    assert_eq!(result.fit.ndim, 2);
    assert!(!result.homogenized);
}

#[test]
fn brute_force_recovers_two_dimensions_from_exact_data() {
    let matrix = rank_two(23, 0.0);
    let search = SearchConfig {
        candidates: vec![1, 2, 3],
        ..SearchConfig::default()
    };
    let solver = solver();
    let result = DimensionSelector::new(&search, &solver).run(&matrix).unwrap();

    assert_eq!(result.ndim, 2, "{:#?}", result.table);
    let at = |d: usize| result.stats_for(d).and_then(|row| row.objectivity).unwrap();
    assert!(at(2) > at(1), "{:#?}", result.table);
    assert!(at(2) > at(3), "{:#?}", result.table);
    assert!(at(2) > 0.99, "{:#?}", result.table);
    for row in &result.table {
        let objectivity = row.objectivity.unwrap();
        assert!((0.0..=1.0).contains(&objectivity), "{row:?}");
    }
}

#[test]
fn bisection_agrees_with_fewer_evaluations() {
    let matrix = noisy_rank_two(17);
    let search = SearchConfig {
        candidates: vec![1, 2, 3, 4],
        mode: SearchMode::Bisection,
        ..SearchConfig::default()
    };
    let solver = solver();
    let result = DimensionSelector::new(&search, &solver).run(&matrix).unwrap();

    assert_eq!(result.ndim, 2, "{:#?}", result.table);
    assert!(result.table.len() < 4, "evaluated {:?}", result.table);
    assert!(result.table.windows(2).all(|w| w[0].ndim < w[1].ndim));
}

#[test]
fn homogenized_search_recovers_the_original_shape() {
    let matrix = noisy_rank_two(5);
    let search = SearchConfig {
        candidates: vec![1, 2],
        homogenize: Homogenize::ReduceAndRecover,
        ..SearchConfig::default()
    };
    let solver = solver();
    let result = DimensionSelector::new(&search, &solver).run(&matrix).unwrap();

    assert!(!result.homogenized);
    assert_eq!(result.fit.estimates.dim(), matrix.shape());
    assert_eq!(result.fit.row_keys, matrix.row_keys());

    // The columns are the smaller facet: they come from the cross-product fit and stay
    // fixed while the rows are estimated.
    let (reduced, facet) = homogenize(&matrix).unwrap();
    assert_eq!(facet, Facet::Columns);
    let reduced_fit = AlsSolver::new(&solver.with_ndim(result.ndim))
        .run(&reduced)
        .unwrap();
    assert!(result.fit.col_anchored.iter().all(|&fixed| fixed));
    assert!(result.fit.row_anchored.iter().all(|&fixed| !fixed));
    assert_eq!(result.fit.col_coords, reduced_fit.col_coords);
    assert_eq!(result.fit.under_determined(Facet::Rows), 0);
}

#[test]
fn reduced_search_fits_the_cross_product_matrix() {
    let matrix = noisy_rank_two(9);
    let search = SearchConfig {
        candidates: vec![1, 2, 3],
        homogenize: Homogenize::Reduce,
        ..SearchConfig::default()
    };
    let solver = solver();
    let result = DimensionSelector::new(&search, &solver).run(&matrix).unwrap();

    assert!(result.homogenized);
    assert_eq!(result.fit.estimates.dim(), (20, 20));
    assert_eq!(result.fit.row_keys, matrix.col_keys());
    assert_eq!(result.fit.col_keys, matrix.col_keys());
    assert_eq!(result.fit.ndim, result.ndim);
    assert_eq!(result.table.len(), 3);
}

#[derive(Default)]
struct Recorder {
    totals: Vec<(SolverStage, usize)>,
    advances: Vec<usize>,
    finished: usize,
}

impl SolverProgressObserver for Recorder {
    fn on_stage_start(&mut self, stage: SolverStage, total: usize) {
        self.totals.push((stage, total));
    }

    fn on_stage_advance(&mut self, stage: SolverStage, done: usize) {
        assert_eq!(stage, SolverStage::DimensionSearch);
        self.advances.push(done);
    }

    fn on_stage_finish(&mut self, _stage: SolverStage) {
        self.finished += 1;
    }
}

#[test]
fn brute_force_reports_each_finished_candidate() {
    let matrix = noisy_rank_two(31);
    let search = SearchConfig {
        candidates: vec![1, 2, 3, 4],
        ..SearchConfig::default()
    };
    let solver = solver();
    let mut recorder = Recorder::default();
    let result = DimensionSelector::new(&search, &solver)
        .with_observer(&mut recorder)
        .run(&matrix)
        .unwrap();

    assert_eq!(result.table.len(), 4);
    assert_eq!(recorder.totals, vec![(SolverStage::DimensionSearch, 4)]);
    assert_eq!(recorder.advances, vec![1, 2, 3, 4]);
    assert_eq!(recorder.finished, 1);
}
