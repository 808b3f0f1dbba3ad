//! 🚀 dbroker-cli: the front door, the bouncer, the maitre d' of dbroker.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Thin wrapper: parse args, load config, set up logging, build an HTTP client for the
//! backend you named, then let the library do the heavy lifting. Like a manager. 🦆
//!
//! - `query` streams records to stdout as NDJSON. Logs and the progress spinner go to stderr,
//!   so `dbroker-cli query ... | jq` stays clean.
//! - `bulk-insert` reads NDJSON (optionally `.gz`) and prints a summary table.
//!
//! Only the HTTP backends can be built from config. Mongo and ODBC need a driver binding, which
//! this binary does not ship.

use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, CellAlignment, Table, presets::UTF8_FULL};
use dbroker::{
    AppConfig, BackendClient, BackendKind, BulkInsertRequest, ElasticsearchClient, ProgressMetrics,
    QueryPayload, QueryRequest, Record, SplunkClient, WriteSummary,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dbroker-cli", version, about = "🔌 One query surface, four backends.")]
struct Cli {
    /// 🔧 TOML config file, merged over DBROKER_* environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 🔎 Run one query and print every record as NDJSON.
    Query(QueryArgs),
    /// ✍️ Bulk insert records from an NDJSON file.
    BulkInsert(BulkInsertArgs),
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long)]
    backend: String,
    /// 📍 Elasticsearch index.
    #[arg(long)]
    index: Option<String>,
    /// 📝 A JSON body (elasticsearch) or a search string (splunk).
    #[arg(long)]
    query: Option<String>,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    max_results: Option<u64>,
    #[arg(long)]
    scroll_ttl: Option<String>,
    /// ⏰ Splunk `earliest_time`, e.g. `-24h`.
    #[arg(long)]
    earliest: Option<String>,
    #[arg(long)]
    latest: Option<String>,
    /// 🙈 No spinner on stderr.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct BulkInsertArgs {
    #[arg(long)]
    backend: String,
    #[arg(long)]
    index: Option<String>,
    /// 📁 NDJSON input, one record per line. `.gz` is decompressed on the way in.
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value = "_id")]
    id_field: String,
    #[arg(long)]
    max_request_size_bytes: Option<usize>,
}

/// 🚀 main(): where it all begins. The "I pressed enter and held my breath" moment.
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 stderr, so stdout stays pure NDJSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            if looks_like_connection_trouble(&cause.to_string()) {
                the_vibes_are_giving_connection_issues = true;
            }
        }
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like a service isn't reachable. \
                Double-check that Elasticsearch or Splunk is actually running and that the url in \
                your config points at it. If you're using Docker, `docker ps` is your friend. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

fn looks_like_connection_trouble(cause: &str) -> bool {
    cause.contains("error sending request")
        || cause.contains("connection refused")
        || cause.contains("Connection refused")
        || cause.contains("tcp connect error")
        || cause.contains("dns error")
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(ref path) = cli.config {
        let exists = path.try_exists().with_context(|| {
            format!("💀 Couldn't check whether the configuration file exists: '{}'", path.display())
        })?;
        if !exists {
            bail!(
                "💀 Configuration file '{}' does not exist. If it's a relative path, check your cwd, or use an absolute path to be absolutely certain.",
                path.display()
            );
        }
    }
    let app_config = dbroker::load_config(cli.config.as_deref())
        .context("💀 Couldn't load the configuration. Make sure you didn't forget something obvious.")?;

    match cli.command {
        Command::Query(args) => run_query(&app_config, args).await,
        Command::BulkInsert(args) => run_bulk_insert(&app_config, args).await,
    }
}

/// 🔌 Build the native client from config. HTTP backends only.
fn build_client(backend: BackendKind, config: &AppConfig) -> Result<BackendClient> {
    match backend {
        BackendKind::Elasticsearch => {
            let es = config
                .elasticsearch
                .clone()
                .context("💀 No [elasticsearch] block in the configuration (or DBROKER_ELASTICSEARCH__URL).")?;
            Ok(BackendClient::Elasticsearch(ElasticsearchClient::new(es)?))
        }
        BackendKind::Splunk => {
            let splunk = config
                .splunk
                .clone()
                .context("💀 No [splunk] block in the configuration (or DBROKER_SPLUNK__URL).")?;
            Ok(BackendClient::Splunk(SplunkClient::new(splunk)?))
        }
        BackendKind::Mongo | BackendKind::Odbc => bail!(
            "💀 The {backend} backend needs a driver binding this CLI does not ship. Use the dbroker library with your own client."
        ),
    }
}

fn parse_payload(query: Option<String>) -> QueryPayload {
    match query {
        None => QueryPayload::Empty,
        Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value @ serde_json::Value::Object(_)) => QueryPayload::Structured(value),
            _ => QueryPayload::Search(raw),
        },
    }
}

async fn run_query(config: &AppConfig, args: QueryArgs) -> Result<()> {
    let backend: BackendKind = args.backend.parse()?;
    let client = build_client(backend, config)?;

    let mut request = QueryRequest::new(backend)
        .with_defaults(&config.query)
        .payload(parse_payload(args.query))
        .time_range(args.earliest, args.latest);
    if let Some(index) = args.index {
        request = request.index(index);
    }
    if let Some(page_size) = args.page_size {
        request = request.page_size(page_size);
    }
    if let Some(max_results) = args.max_results {
        request = request.max_results(max_results);
    }
    if let Some(ttl) = args.scroll_ttl {
        request = request.scroll_ttl(ttl);
    }

    let mut stream = dbroker::query(&client, request)?;
    let mut progress = if args.no_progress {
        ProgressMetrics::hidden(format!("{backend} query"))
    } else {
        ProgressMetrics::new(format!("{backend} query"))
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    while let Some(record) = stream.next().await {
        let record = record?;
        let line = serde_json::to_string(&record).context("💀 A record refused to serialize")?;
        writeln!(out, "{line}").context("💀 stdout closed on us")?;
        progress.update(line.len() as u64 + 1, 1);
    }
    out.flush().context("💀 stdout closed on us")?;
    progress.finish();

    info!(
        "✅ {} records from {} in {:?}",
        progress.total_records(),
        backend,
        progress.elapsed()
    );
    Ok(())
}

/// 📁 Read the whole input, gunzipping `.gz` files.
async fn read_input(path: &Path) -> Result<Vec<u8>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("💀 Couldn't read input file '{}'", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .with_context(|| format!("💀 '{}' claims to be gzip but isn't", path.display()))?;
        Ok(decoded)
    } else {
        Ok(raw)
    }
}

/// ✂️ One record per non-blank line. Line numbers in errors are 1-based.
fn parse_ndjson(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut start = 0;
    let ends = memchr::memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
    for (i, end) in ends.enumerate() {
        let line = bytes[start..end].trim_ascii();
        start = end + 1;
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_slice(line)
            .with_context(|| format!("💀 Line {} is not valid JSON", i + 1))?;
        let record =
            Record::try_from(value).with_context(|| format!("💀 Line {} is not a record", i + 1))?;
        records.push(record);
    }
    Ok(records)
}

async fn run_bulk_insert(config: &AppConfig, args: BulkInsertArgs) -> Result<()> {
    let backend: BackendKind = args.backend.parse()?;
    let bytes = read_input(&args.input).await?;
    let records = parse_ndjson(&bytes)?;
    info!("📦 {} records read from {}", records.len(), args.input.display());

    let mut request = BulkInsertRequest::new(backend, records)
        .with_defaults(&config.query)
        .id_field(args.id_field);
    request.index = args.index;
    if let Some(bytes) = args.max_request_size_bytes {
        request = request.max_request_size_bytes(bytes);
    }

    if !backend.supports_bulk_insert() {
        return Err(dbroker::BrokerError::UnsupportedOperation {
            backend,
            operation: "bulk_insert",
        }
        .into());
    }
    let client = build_client(backend, config)?;
    let summary = dbroker::bulk_insert(&client, request).await?;
    println!("{}", render_summary(&summary));
    Ok(())
}

/// 🍽️ Totals on top, then the first few failures so a 10k-error run doesn't flood the terminal.
fn render_summary(summary: &WriteSummary) -> Table {
    const MAX_FAILURES_SHOWN: usize = 20;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["backend", "submitted", "written", "failed"]);
    table.add_row(vec![
        Cell::new(summary.backend),
        Cell::new(summary.submitted).set_alignment(CellAlignment::Right),
        Cell::new(summary.written).set_alignment(CellAlignment::Right),
        Cell::new(summary.failures.len()).set_alignment(CellAlignment::Right),
    ]);
    for failure in summary.failures.iter().take(MAX_FAILURES_SHOWN) {
        table.add_row(vec![
            Cell::new(""),
            Cell::new(failure.position.map(|p| format!("#{p}")).unwrap_or_default()),
            Cell::new(failure.id.clone().unwrap_or_default()),
            Cell::new(&failure.reason),
        ]);
    }
    if summary.failures.len() > MAX_FAILURES_SHOWN {
        table.add_row(vec![
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(format!("... and {} more", summary.failures.len() - MAX_FAILURES_SHOWN)),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbroker::WriteFailure;

    #[test]
    fn the_one_where_ndjson_skips_blank_lines_and_keeps_order() {
        let input = b"{\"a\":1}\n\n  {\"a\":2}  \r\n{\"a\":3}";
        let records = parse_ndjson(input).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["a"], serde_json::json!(3));
    }

    #[test]
    fn the_one_where_a_bad_line_is_named_by_number() {
        let err = parse_ndjson(b"{\"ok\":true}\n[1,2]\n").unwrap_err();
        assert!(format!("{err:#}").contains("Line 2"));
        let err = parse_ndjson(b"{\"ok\":true}\n{nope\n").unwrap_err();
        assert!(format!("{err:#}").contains("Line 2"));
    }

    #[test]
    fn the_one_where_queries_are_json_when_they_can_be() {
        assert!(matches!(parse_payload(None), QueryPayload::Empty));
        assert!(matches!(
            parse_payload(Some(r#"{"query":{"match_all":{}}}"#.into())),
            QueryPayload::Structured(_)
        ));
        assert!(matches!(
            parse_payload(Some("search index=main | head 10".into())),
            QueryPayload::Search(s) if s.starts_with("search")
        ));
    }

    #[test]
    fn the_one_where_driver_backends_are_turned_away_politely() {
        let err = build_client(BackendKind::Mongo, &AppConfig::default()).unwrap_err();
        assert!(err.to_string().contains("driver binding"));
        let err = build_client(BackendKind::Elasticsearch, &AppConfig::default()).unwrap_err();
        assert!(err.to_string().contains("[elasticsearch]"));
    }

    #[test]
    fn the_one_where_the_summary_table_lists_failures() {
        let summary = WriteSummary {
            backend: BackendKind::Elasticsearch,
            submitted: 3,
            written: 2,
            failures: vec![WriteFailure {
                position: Some(1),
                id: Some("b".into()),
                reason: "mapper_parsing_exception: bad field".into(),
            }],
        };
        let rendered = render_summary(&summary).to_string();
        assert!(rendered.contains("elasticsearch"));
        assert!(rendered.contains("#1"));
        assert!(rendered.contains("mapper_parsing_exception"));
    }

    #[test]
    fn the_one_where_the_args_parse() {
        let cli = Cli::try_parse_from([
            "dbroker-cli",
            "--config",
            "dbroker.toml",
            "query",
            "--backend",
            "elasticsearch",
            "--index",
            "logs",
            "--max-results",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("dbroker.toml")));
        match cli.command {
            Command::Query(args) => {
                assert_eq!(args.index.as_deref(), Some("logs"));
                assert_eq!(args.max_results, Some(5));
            }
            other => panic!("💀 expected query, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_connection_errors_get_a_hint() {
        assert!(looks_like_connection_trouble("error sending request for url (http://localhost:9200/)"));
        assert!(!looks_like_connection_trouble("mapper_parsing_exception"));
    }
}
