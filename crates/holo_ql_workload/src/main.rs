//! Workload generator for exercising conditional DML against an in-process
//! cluster.
//!
//! The generator models a stock ticker: each client owns a handful of
//! symbols and, until the deadline, either records a new tick with a
//! guarded insert, upserts a batch of ticks through a manual-flush session,
//! or reads the latest ticks of a symbol in reverse range order. A JSON
//! summary of outcomes and latencies is printed or written to `--out`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use holo_ql::{
    Client, Cluster, ClusterConfig, CompareOp, Condition, DataType, FlushMode, QlError,
    ResponseStatus, Schema, Session, SessionConfig, Table,
};

const TABLE_NAME: &str = "stock_ticks";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-ql-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Tablet servers in the in-process cluster.
    #[arg(long, env = "HOLO_QL_TABLET_SERVERS", default_value_t = 3)]
    tablet_servers: usize,

    /// Tablets created for the ticker table.
    #[arg(long, default_value_t = 6)]
    tablets: usize,

    /// Store rows in fjall under this directory instead of memory.
    #[arg(long, env = "HOLO_QL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Number of concurrent clients (each client drives one session).
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Symbols owned by each client.
    #[arg(long, default_value_t = 4)]
    symbols_per_client: usize,

    /// Percent of operations that are guarded single-tick inserts.
    #[arg(long, default_value_t = 30)]
    insert_pct: u8,

    /// Percent of operations that are batched upserts (the rest are reads).
    #[arg(long, default_value_t = 30)]
    batch_pct: u8,

    /// Ticks per batched upsert.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Ticks returned by a latest-N read.
    #[arg(long, default_value_t = 10)]
    latest: u64,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Session timeout for every apply and flush.
    #[arg(long, env = "HOLO_QL_SESSION_TIMEOUT", default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// When true, any failed operation aborts the run.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    fail_fast: bool,

    /// Write the JSON summary to this path instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Parameters embedded in the summary for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct RunMeta {
    tablet_servers: usize,
    tablets: usize,
    persistent: bool,
    clients: usize,
    symbols_per_client: usize,
    insert_pct: u8,
    batch_pct: u8,
    batch_size: usize,
    latest: u64,
    duration_ms: u64,
    seed: u64,
}

/// Full workload summary.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct Summary {
    meta: RunMeta,
    elapsed_ms: u64,
    guarded_inserts: OpStats,
    batched_upserts: OpStats,
    latest_reads: OpStats,
    /// Guarded inserts that found the tick already present.
    not_applied: u64,
    rows_written: u64,
    rows_read: u64,
    tablets: Vec<TabletSummary>,
}

/// Per-tablet counters at the end of the run.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct TabletSummary {
    tablet_id: u64,
    write_ops: u64,
    read_ops: u64,
    rows_scanned: u64,
    rows_returned: u64,
}

/// Outcome and latency counters of one operation kind.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Default)]
struct OpStats {
    ok: u64,
    failed: u64,
    timed_out: u64,
    total_us: u64,
    max_us: u64,
}

impl OpStats {
    fn record(&mut self, status: ResponseStatus, elapsed: Duration) {
        match status {
            ResponseStatus::Ok => self.ok += 1,
            ResponseStatus::Timeout => self.timed_out += 1,
            _ => self.failed += 1,
        }
        let us = elapsed.as_micros() as u64;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
    }

    fn merge(&mut self, other: &OpStats) {
        self.ok += other.ok;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.total_us += other.total_us;
        self.max_us = self.max_us.max(other.max_us);
    }

    fn errors(&self) -> u64 {
        self.failed + self.timed_out
    }
}

/// What one client observed.
#[derive(Debug, Default)]
struct ClientReport {
    guarded_inserts: OpStats,
    batched_upserts: OpStats,
    latest_reads: OpStats,
    not_applied: u64,
    rows_written: u64,
    rows_read: u64,
}

/// Operation chosen for one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpKind {
    GuardedInsert,
    BatchedUpsert,
    LatestRead,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.cmd {
        // Run the workload generator.
        Command::Run(args) => run(args).await,
    }
}

/// `symbol STRING` hash key, `ts INT64` range key, then the tick payload.
fn ticker_schema() -> anyhow::Result<Schema> {
    Schema::builder()
        .hash_column("symbol", DataType::String)
        .range_column("ts", DataType::Int64)
        .column("price", DataType::Double)
        .column("volume", DataType::Int64)
        .column("exchange", DataType::String)
        .build()
        .context("build ticker schema")
}

/// Start a cluster, drive the clients until the deadline and report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.symbols_per_client > 0, "--symbols-per-client must be > 0");
    anyhow::ensure!(args.batch_size > 0, "--batch-size must be > 0");
    anyhow::ensure!(
        u16::from(args.insert_pct) + u16::from(args.batch_pct) <= 100,
        "--insert-pct plus --batch-pct must be <= 100"
    );

    let duration: Duration = args.duration.into();
    let op_timeout: Duration = args.op_timeout.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let mut config = match &args.data_dir {
        Some(dir) => ClusterConfig::persistent(dir, args.tablet_servers),
        None => ClusterConfig::in_memory(args.tablet_servers),
    };
    config.client.session = SessionConfig::default().with_timeout(op_timeout);
    let cluster = Cluster::start(config).context("start cluster")?;
    let client = cluster.client();
    let table = open_or_create(&client, args.tablets).await?;
    info!(
        table = TABLE_NAME,
        tablets = table.partitions().tablets().len(),
        clients = args.clients,
        seed,
        "workload starting"
    );

    let start = time::Instant::now();
    let deadline = start + duration;

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let client = client.clone();
        let table = table.clone();
        let args = args.clone();
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(client_id, client, table, args, seed, start, deadline).await
        }));
    }

    let mut report = ClientReport::default();
    for task in tasks {
        let client_report = task.await.context("client task panicked")??;
        report.guarded_inserts.merge(&client_report.guarded_inserts);
        report.batched_upserts.merge(&client_report.batched_upserts);
        report.latest_reads.merge(&client_report.latest_reads);
        report.not_applied += client_report.not_applied;
        report.rows_written += client_report.rows_written;
        report.rows_read += client_report.rows_read;
    }
    let elapsed = start.elapsed();

    let tablets = cluster
        .tablet_load()
        .into_iter()
        .map(|(tablet_id, load)| TabletSummary {
            tablet_id,
            write_ops: load.write_ops,
            read_ops: load.read_ops,
            rows_scanned: load.rows_scanned,
            rows_returned: load.rows_returned,
        })
        .collect();

    let summary = Summary {
        meta: RunMeta {
            tablet_servers: args.tablet_servers,
            tablets: args.tablets,
            persistent: args.data_dir.is_some(),
            clients: args.clients,
            symbols_per_client: args.symbols_per_client,
            insert_pct: args.insert_pct,
            batch_pct: args.batch_pct,
            batch_size: args.batch_size,
            latest: args.latest,
            duration_ms: duration.as_millis() as u64,
            seed,
        },
        elapsed_ms: elapsed.as_millis() as u64,
        guarded_inserts: report.guarded_inserts,
        batched_upserts: report.batched_upserts,
        latest_reads: report.latest_reads,
        not_applied: report.not_applied,
        rows_written: report.rows_written,
        rows_read: report.rows_read,
        tablets,
    };
    info!(
        elapsed = ?elapsed,
        rows_written = summary.rows_written,
        rows_read = summary.rows_read,
        "workload finished"
    );

    write_summary(args.out.as_ref(), &summary).context("write summary")?;
    drop((client, table));
    cluster.shutdown().context("shutdown cluster")?;
    Ok(())
}

/// Reuse the ticker table of a persistent cluster, or create it.
async fn open_or_create(client: &Client, tablets: usize) -> anyhow::Result<Table> {
    if client.list_tables().iter().any(|name| name == TABLE_NAME) {
        return client
            .open_table(TABLE_NAME)
            .await
            .context("open ticker table");
    }
    client
        .create_table(TABLE_NAME, ticker_schema()?, tablets)
        .await
        .context("create ticker table")
}

/// Run a single client session until the deadline, returning its report.
async fn run_client(
    client_id: usize,
    client: Client,
    table: Table,
    args: RunArgs,
    seed: u64,
    start: time::Instant,
    deadline: time::Instant,
) -> anyhow::Result<ClientReport> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = ClientReport::default();
    let mut session = client.new_session();
    let mut batch_session = client.new_session();
    batch_session.set_flush_mode(FlushMode::ManualFlush)?;
    let symbols = (0..args.symbols_per_client)
        .map(|i| format!("SYM{client_id:03}_{i}"))
        .collect::<Vec<_>>();

    while time::Instant::now() < deadline {
        let symbol = &symbols[rng.gen_range(0..symbols.len())];
        let roll = rng.gen_range(0..100u8);
        let kind = if roll < args.insert_pct {
            OpKind::GuardedInsert
        } else if roll < args.insert_pct + args.batch_pct {
            OpKind::BatchedUpsert
        } else {
            OpKind::LatestRead
        };
        // Ticks are keyed by elapsed microseconds; a coarse clock may repeat a
        // key, which the guarded insert then reports as not applied.
        let ts = start.elapsed().as_micros() as i64;

        let began = time::Instant::now();
        let outcome = match kind {
            OpKind::GuardedInsert => {
                guarded_insert(&mut session, &table, symbol, ts, &mut rng, &mut report).await
            }
            OpKind::BatchedUpsert => {
                batched_upsert(
                    &mut batch_session,
                    &table,
                    symbol,
                    ts,
                    &args,
                    &mut rng,
                    &mut report,
                )
                .await
            }
            OpKind::LatestRead => {
                latest_read(&mut session, &table, symbol, args.latest, &mut report).await
            }
        };
        let status = match outcome {
            Ok(status) => status,
            Err(QlError::Timeout { .. }) => ResponseStatus::Timeout,
            Err(err) => {
                warn!(client_id, op = ?kind, error = %err, "operation failed");
                ResponseStatus::SessionError
            }
        };
        let stats = match kind {
            OpKind::GuardedInsert => &mut report.guarded_inserts,
            OpKind::BatchedUpsert => &mut report.batched_upserts,
            OpKind::LatestRead => &mut report.latest_reads,
        };
        stats.record(status, began.elapsed());
        if args.fail_fast && stats.errors() > 0 {
            // Abort immediately on the first failure when fail-fast is enabled.
            anyhow::bail!("client {client_id} {kind:?} ended with {status:?}");
        }
    }

    Ok(report)
}

/// `insert into stock_ticks (...) values (...) if not exists`
async fn guarded_insert(
    session: &mut Session,
    table: &Table,
    symbol: &str,
    ts: i64,
    rng: &mut SmallRng,
    report: &mut ClientReport,
) -> Result<ResponseStatus, QlError> {
    let op = table.new_insert_op();
    op.request_mut()
        .add_hash_value(symbol)
        .add_range_value(ts)
        .set_column("price", rng.gen_range(10.0..500.0f64))
        .set_column("volume", rng.gen_range(1..10_000i64))
        .set_column("exchange", "XNYS")
        .set_if_expr(Condition::NotExists);
    session.apply(&op).await?;
    let response = op.completed().await;
    match response.applied() {
        Some(true) => report.rows_written += 1,
        Some(false) => report.not_applied += 1,
        None => {}
    }
    Ok(response.status())
}

/// Buffer `batch_size` consecutive ticks in a manual-flush session and flush
/// them as one batch.
async fn batched_upsert(
    session: &mut Session,
    table: &Table,
    symbol: &str,
    ts: i64,
    args: &RunArgs,
    rng: &mut SmallRng,
    report: &mut ClientReport,
) -> Result<ResponseStatus, QlError> {
    let mut ops = Vec::with_capacity(args.batch_size);
    for i in 0..args.batch_size {
        let op = table.new_insert_op();
        op.request_mut()
            .add_hash_value(symbol)
            .add_range_value(ts + i as i64)
            .set_column("price", rng.gen_range(10.0..500.0f64))
            .set_column("volume", rng.gen_range(1..10_000i64));
        session.apply(&op).await?;
        ops.push(op);
    }
    let summary = session.flush().await?;
    report.rows_written += summary.ok as u64;
    let status = ops
        .iter()
        .filter_map(|op| op.response())
        .map(|response| response.status())
        .find(|status| *status != ResponseStatus::Ok)
        .unwrap_or(ResponseStatus::Ok);
    Ok(status)
}

/// `select ts, price, volume from stock_ticks where symbol = ? and ts >= 0
/// order by ts desc limit ?`
async fn latest_read(
    session: &mut Session,
    table: &Table,
    symbol: &str,
    latest: u64,
    report: &mut ClientReport,
) -> Result<ResponseStatus, QlError> {
    let op = table.new_read_op();
    op.request_mut()
        .add_hash_value(symbol)
        .set_where_expr(Condition::and(vec![
            Condition::eq("symbol", symbol),
            Condition::compare("ts", CompareOp::GreaterEqual, 0i64),
        ]))
        .add_columns(["ts", "price", "volume"])
        .set_limit(latest)
        .set_reverse(true);
    session.apply(&op).await?;
    let response = op.completed().await;
    report.rows_read += response.rows().row_count() as u64;
    Ok(response.status())
}

/// Serialize the summary and write it to `path`, or stdout when unset.
fn write_summary(path: Option<&PathBuf>, summary: &Summary) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    let Some(path) = path else {
        println!("{}", String::from_utf8_lossy(&data));
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    eprintln!("wrote summary: {}", path.display());
    Ok(())
}
