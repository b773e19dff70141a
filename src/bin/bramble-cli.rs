use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use bramble::btree::{IndexPredicate, Op};
use bramble::bulk::bulk_load;
use bramble::check::check_tree;
use bramble::file::IndexFile;
use bramble::types::{FieldType, Layout, Tuple, Value};
use bramble::Database;

/// Inspect and exercise a B+ tree index file. Records are (key, payload)
/// integer pairs, indexed on the key.
#[derive(Parser)]
#[command(name = "bramble", version)]
struct Cli {
    /// Directory holding the index files
    #[arg(long, default_value = "./bramble-data")]
    dir: PathBuf,

    /// Index name (stored as <dir>/<name>.idx)
    #[arg(long, default_value = "default")]
    name: String,

    /// Page size in bytes
    #[arg(long, default_value_t = 4096)]
    page_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert keys 0..count one transaction each
    Seed {
        #[arg(long)]
        count: i32,
    },
    /// Insert a single record
    Insert {
        key: i32,
        #[arg(default_value_t = 0)]
        payload: i32,
    },
    /// Delete every record matching a key
    Delete { key: i32 },
    /// Print the records matching a predicate
    Search {
        #[arg(value_enum)]
        op: SearchOp,
        key: i32,
    },
    /// Print every record in key order
    Scan,
    /// Verify the tree's structural invariants
    Check {
        /// Also require every non-root page to be at least half full
        #[arg(long)]
        occupancy: bool,
    },
    /// Build a fresh index from sorted keys 0..count
    BulkLoad {
        #[arg(long)]
        count: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl From<SearchOp> for Op {
    fn from(op: SearchOp) -> Self {
        match op {
            SearchOp::Eq => Op::Equals,
            SearchOp::Gt => Op::GreaterThan,
            SearchOp::Gte => Op::GreaterThanOrEq,
            SearchOp::Lt => Op::LessThan,
            SearchOp::Lte => Op::LessThanOrEq,
        }
    }
}

fn layout() -> Layout {
    Layout::new(vec![FieldType::Int, FieldType::Int])
}

fn record(key: i32, payload: i32) -> Tuple {
    Tuple::new(vec![Value::Int(key), Value::Int(payload)])
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Command::BulkLoad { count } = cli.command {
        //  bulk load writes through the file directly, before any buffer
        //  pool gets involved
        std::fs::create_dir_all(&cli.dir)?;
        let path = cli.dir.join(format!("{}.idx", cli.name));
        let file = IndexFile::open(&path, layout(), 0, cli.page_size)?;
        let loaded = bulk_load(&file, (0..count).map(|k| record(k, k)))?;
        println!("loaded {loaded} record(s) into {}", path.display());
        return Ok(());
    }

    let db = Database::new(&cli.dir, cli.page_size, 4096, Duration::from_secs(10));
    let index = db.open_index(&cli.name, layout(), 0)?;

    match cli.command {
        Command::Seed { count } => {
            for key in 0..count {
                let tx = db.new_tx();
                index.insert_tuple(&tx, record(key, key))?;
                tx.commit()?;
            }
            println!("inserted {count} record(s)");
        }
        Command::Insert { key, payload } => {
            let tx = db.new_tx();
            index.insert_tuple(&tx, record(key, payload))?;
            tx.commit()?;
            println!("inserted ({key}, {payload})");
        }
        Command::Delete { key } => {
            let tx = db.new_tx();
            let matches: Vec<Tuple> = index
                .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(key)))?
                .collect::<bramble::error::Result<_>>()?;
            let count = matches.len();
            for tuple in &matches {
                index.delete_tuple(&tx, tuple)?;
            }
            tx.commit()?;
            println!("deleted {count} record(s)");
        }
        Command::Search { op, key } => {
            let tx = db.new_tx();
            let mut count = 0usize;
            for tuple in index.search(&tx, IndexPredicate::new(op.into(), Value::Int(key)))? {
                println!("{}", tuple?);
                count += 1;
            }
            tx.commit()?;
            println!("{count} row(s)");
        }
        Command::Scan => {
            let tx = db.new_tx();
            let mut count = 0usize;
            for tuple in index.iter(&tx)? {
                println!("{}", tuple?);
                count += 1;
            }
            tx.commit()?;
            println!("{count} row(s)");
        }
        Command::Check { occupancy } => {
            let tx = db.new_tx();
            check_tree(&index, &tx, occupancy)?;
            tx.commit()?;
            println!("ok");
        }
        Command::BulkLoad { .. } => unreachable!(),
    }
    Ok(())
}
