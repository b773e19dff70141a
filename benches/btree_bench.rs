use bramble::benchmark_framework::{benchmark, parse_bench_args, print_header, BenchResult};
use bramble::btree::{BTreeFile, IndexPredicate, Op};
use bramble::bulk::bulk_load;
use bramble::file::IndexFile;
use bramble::test_utils::{generate_filename, TestDir};
use bramble::types::{FieldType, Layout, Tuple, Value};
use bramble::Database;

const PAGE_SIZE: usize = 4096;

fn layout() -> Layout {
    Layout::new(vec![FieldType::Int, FieldType::Int])
}

fn record(key: i32) -> Tuple {
    Tuple::new(vec![Value::Int(key), Value::Int(key)])
}

/// Small deterministic generator so runs are comparable without an RNG
/// dependency.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: i32) -> i32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % bound as u64) as i32
    }
}

fn seeded_index(num_records: i32) -> (Database, BTreeFile, TestDir) {
    let (db, dir) = Database::new_for_test(PAGE_SIZE, 8192, 10_000);
    let index = db.open_index("bench", layout(), 0).unwrap();
    let tx = db.new_tx();
    for key in 0..num_records {
        index.insert_tuple(&tx, record(key)).unwrap();
    }
    tx.commit().unwrap();
    (db, index, dir)
}

fn sequential_insert(iterations: usize, num_records: i32) -> BenchResult {
    benchmark("insert (sequential)", iterations, num_records as usize, || {
        let (db, dir) = Database::new_for_test(PAGE_SIZE, 8192, 10_000);
        let index = db.open_index("bench", layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..num_records {
            index.insert_tuple(&tx, record(key)).unwrap();
        }
        tx.commit().unwrap();
        drop(dir);
    })
}

fn random_insert(iterations: usize, num_records: i32) -> BenchResult {
    benchmark("insert (random)", iterations, num_records as usize, || {
        let (db, dir) = Database::new_for_test(PAGE_SIZE, 8192, 10_000);
        let index = db.open_index("bench", layout(), 0).unwrap();
        let tx = db.new_tx();
        let mut rng = Lcg(42);
        for _ in 0..num_records {
            index
                .insert_tuple(&tx, record(rng.next(i32::MAX)))
                .unwrap();
        }
        tx.commit().unwrap();
        drop(dir);
    })
}

fn point_lookup(iterations: usize, num_records: i32) -> BenchResult {
    let (db, index, _dir) = seeded_index(num_records);
    let mut rng = Lcg(7);
    benchmark("point lookup", iterations, 1000, || {
        let tx = db.new_tx();
        for _ in 0..1000 {
            let key = rng.next(num_records);
            let hit = index
                .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(key)))
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            assert_eq!(hit.value(0), &Value::Int(key));
        }
        tx.commit().unwrap();
    })
}

fn full_scan(iterations: usize, num_records: i32) -> BenchResult {
    let (db, index, _dir) = seeded_index(num_records);
    benchmark("full scan", iterations, num_records as usize, || {
        let tx = db.new_tx();
        let count = index.iter(&tx).unwrap().count();
        assert_eq!(count as i32, num_records);
        tx.commit().unwrap();
    })
}

fn bulk_load_sorted(iterations: usize, num_records: i32) -> BenchResult {
    benchmark("bulk load (sorted)", iterations, num_records as usize, || {
        let dir = TestDir::new(format!("/tmp/bench_bulk_{}", generate_filename()));
        let path = dir.as_ref().join(generate_filename());
        let file = IndexFile::open(&path, layout(), 0, PAGE_SIZE).unwrap();
        bulk_load(&file, (0..num_records).map(record)).unwrap();
    })
}

fn delete_half(iterations: usize, num_records: i32) -> BenchResult {
    benchmark("delete half", iterations, num_records as usize / 2, || {
        let (db, index, dir) = seeded_index(num_records);
        let tx = db.new_tx();
        for key in (0..num_records).step_by(2) {
            let hit = index
                .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(key)))
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            index.delete_tuple(&tx, &hit).unwrap();
        }
        tx.commit().unwrap();
        drop(dir);
    })
}

fn main() {
    let (iterations, num_records) = parse_bench_args();
    let num_records = num_records as i32;
    println!("btree benchmarks: {iterations} iterations, {num_records} records");
    println!();

    print_header();
    println!("{}", sequential_insert(iterations, num_records));
    println!("{}", random_insert(iterations, num_records));
    println!("{}", point_lookup(iterations, num_records));
    println!("{}", full_scan(iterations, num_records));
    println!("{}", bulk_load_sorted(iterations, num_records));
    println!("{}", delete_half(iterations, num_records));
}
