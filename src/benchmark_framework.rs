use std::time::{Duration, Instant};
use std::{env, fmt};

/// Timing summary for one benchmarked operation. `records` is how many
/// index records a single run touches; it feeds the throughput column.
pub struct BenchResult {
    pub operation: String,
    pub mean: Duration,
    pub median: Duration,
    pub min: Duration,
    pub std_dev: Duration,
    pub iterations: usize,
    pub records: usize,
}

impl BenchResult {
    /// Records per second at the mean run time.
    pub fn records_per_sec(&self) -> f64 {
        if self.mean.is_zero() {
            return f64::INFINITY;
        }
        self.records as f64 / self.mean.as_secs_f64()
    }
}

impl fmt::Display for BenchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:24} | {:>10.2?} | {:>10.2?} | {:>10.2?} | {:>10.2?} | {:>11.0} | {:>6}",
            self.operation,
            self.mean,
            self.median,
            self.min,
            self.std_dev,
            self.records_per_sec(),
            self.iterations
        )
    }
}

/// Positional args: iterations, then record count. Flags like `--bench`
/// that cargo passes through are skipped.
pub fn parse_bench_args() -> (usize, usize) {
    let mut numeric_args = env::args()
        .skip(1)
        .filter(|arg| !arg.starts_with("--"))
        .filter_map(|arg| arg.parse::<usize>().ok());
    let iterations = numeric_args.next().unwrap_or(10);
    let num_records = numeric_args.next().unwrap_or(10_000);
    (iterations, num_records)
}

/// Time `operation` over `iterations` runs, after one untimed warmup run
/// to populate the page cache.
pub fn benchmark<F>(name: &str, iterations: usize, records: usize, mut operation: F) -> BenchResult
where
    F: FnMut(),
{
    operation();

    let mut durations = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        operation();
        durations.push(start.elapsed());
    }
    summarize(name, records, durations)
}

fn summarize(name: &str, records: usize, mut durations: Vec<Duration>) -> BenchResult {
    durations.sort();
    let iterations = durations.len();
    let mean = durations.iter().sum::<Duration>() / iterations as u32;
    let median = if iterations % 2 == 1 {
        durations[iterations / 2]
    } else {
        (durations[iterations / 2 - 1] + durations[iterations / 2]) / 2
    };
    let variance: f64 = if iterations > 1 {
        durations
            .iter()
            .map(|d| (d.as_nanos() as f64 - mean.as_nanos() as f64).powi(2))
            .sum::<f64>()
            / (iterations as f64 - 1.0)
    } else {
        0.0
    };

    BenchResult {
        operation: name.to_string(),
        mean,
        median,
        min: durations[0],
        std_dev: Duration::from_nanos(variance.sqrt() as u64),
        iterations,
        records,
    }
}

pub fn print_header() {
    println!(
        "{:24} | {:>10} | {:>10} | {:>10} | {:>10} | {:>11} | {:>6}",
        "Operation", "Mean", "Median", "Min", "StdDev", "Records/s", "Iters"
    );
    println!("{}", "-".repeat(100));
}
