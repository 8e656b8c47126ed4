use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gauge::als::{AlsSolver, SolverConfig};
use gauge::types::{MISSING, ObservationMatrix};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NDIM: usize = 3;

/// Rank-3 persons-by-items matrix with a fifth of the cells missing.
fn sparse_matrix(rows: usize, cols: usize) -> ObservationMatrix {
    let mut rng = StdRng::seed_from_u64(0x5EED_A15 + rows as u64);
    let persons = Array2::from_shape_fn((rows, NDIM), |_| rng.sample::<f64, _>(Standard));
    let items = Array2::from_shape_fn((cols, NDIM), |_| rng.sample::<f64, _>(Standard));
    let mut values = persons.dot(&items.t());
    values.mapv_inplace(|v| if rng.gen_bool(0.2) { MISSING } else { v });
    ObservationMatrix::from_values(values).expect("benchmark matrix")
}

fn benchmark_als(c: &mut Criterion) {
    let shapes = [(200_usize, 40_usize), (1000, 80), (4000, 120)];
    let matrices: Vec<_> = shapes
        .iter()
        .map(|&(rows, cols)| ((rows, cols), sparse_matrix(rows, cols)))
        .collect();

    // Fixed sweep count so every size does the same amount of work per cell.
    let config = SolverConfig {
        ndim: NDIM,
        tolerance: 0.0,
        max_sweeps: 5,
        jolt: None,
        ..SolverConfig::default()
    };

    let mut group = c.benchmark_group("als_sweep");
    group.sample_size(10);
    for ((rows, cols), matrix) in matrices.iter() {
        group.throughput(Throughput::Elements(matrix.observed_count() as u64));
        group.bench_with_input(
            BenchmarkId::new("five_sweeps", format!("{rows}x{cols}")),
            matrix,
            |b, input| {
                b.iter(|| {
                    let fit = AlsSolver::new(&config).run(black_box(input)).expect("fit");
                    black_box(fit.estimates);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(als_sweep, benchmark_als);
criterion_main!(als_sweep);
