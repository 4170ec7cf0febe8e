//! Purpose: `pagewise` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout; notices and errors go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::future::Future;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod serve;

use pagewise::api::{
    CacheOptions, DEFAULT_PAGE_SIZE, Error, ErrorKind, ListSnapshot, Page, PageSource,
    PaginatedListCache, Period, Query, RangeBounds, RemoteClient, RemoteCollection, to_exit_code,
};
use pagewise::notice::Notice;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    if cli.verbose {
        init_cli_tracing();
    }

    command_dispatch::dispatch_command(cli.command)
        .map_err(add_transport_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "pagewise",
    version,
    about = "Cursor-based pagination server and incremental list client",
    long_about = None,
    after_help = r#"EXAMPLES
  $ pagewise serve --catalog catalog.json
  $ pagewise fetch http://127.0.0.1:9710 events --order created_at --desc --limit 20
  $ pagewise browse http://127.0.0.1:9710 events --order created_at --desc --period month

LEARN MORE
  $ pagewise <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, global = true, help = "Log library events to stderr (honors RUST_LOG)")]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PeriodCli {
    Day,
    Month,
    Year,
}

impl From<PeriodCli> for Period {
    fn from(period: PeriodCli) -> Self {
        match period {
            PeriodCli::Day => Period::Day,
            PeriodCli::Month => Period::Month,
            PeriodCli::Year => Period::Year,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the collections declared in a catalog over HTTP",
        after_help = r#"EXAMPLES
  $ pagewise serve --catalog catalog.json
  $ pagewise serve --catalog catalog.json --bind 0.0.0.0:9710 --allow-non-loopback --token secret"#
    )]
    Serve(ServeArgs),
    #[command(about = "Validate a catalog and print a summary of its collections")]
    Check {
        #[arg(long, help = "Catalog JSON file", value_hint = ValueHint::FilePath)]
        catalog: PathBuf,
    },
    #[command(
        about = "Fetch one page from a remote collection",
        after_help = r#"EXAMPLES
  $ pagewise fetch http://127.0.0.1:9710 events --order created_at --limit 2
  $ pagewise fetch http://127.0.0.1:9710 events --order created_at --after 2024-01-05T00:00:00Z"#
    )]
    Fetch {
        #[command(flatten)]
        target: RemoteArgs,
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value_t = 0, help = "Page size (0 uses the server default)")]
        limit: u32,
        #[arg(long, help = "Return records strictly after this sort value")]
        after: Option<String>,
        #[arg(long, help = "Return records strictly before this sort value")]
        before: Option<String>,
        #[arg(long, help = "Read at a pinned commit sequence")]
        state_at: Option<u64>,
    },
    #[command(
        about = "Load a list incrementally through the client-side list cache",
        after_help = r#"EXAMPLES
  $ pagewise browse http://127.0.0.1:9710 events --order created_at --pages 3
  $ pagewise browse http://127.0.0.1:9710 events --order created_at --desc --period month"#
    )]
    Browse {
        #[command(flatten)]
        target: RemoteArgs,
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, help = "Page size for every request")]
        limit: u32,
        #[arg(long, default_value_t = 1, conflicts_with = "period", help = "Pages to load")]
        pages: u32,
        #[arg(long, value_enum, help = "Top up until the leading record's period is complete")]
        period: Option<PeriodCli>,
    },
    #[command(about = "Insert or replace records from a JSONL file")]
    Append {
        #[command(flatten)]
        target: RemoteArgs,
        #[arg(long, help = "JSONL file of {\"id\",\"data\"} records", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, help = "Catalog JSON file", value_hint = ValueHint::FilePath)]
    catalog: PathBuf,
    #[arg(long, default_value = "127.0.0.1:9710", help = "Address to bind")]
    bind: String,
    #[arg(long, help = "Require this bearer token on every request")]
    token: Option<String>,
    #[arg(long, help = "Permit binding a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(long, default_value_t = 1024 * 1024, help = "Maximum request body size")]
    max_body_bytes: u64,
    #[arg(long = "cors-origin", help = "Allowed CORS origin (repeatable, `*` for any)")]
    cors_origins: Vec<String>,
}

#[derive(Args)]
struct RemoteArgs {
    #[arg(help = "Server base URL, e.g. http://127.0.0.1:9710")]
    base_url: String,
    #[arg(help = "Collection name")]
    collection: String,
    #[arg(long, help = "Bearer token for the server")]
    token: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long, help = "Sort field")]
    order: String,
    #[arg(long, help = "Sort descending")]
    desc: bool,
    #[arg(long = "filter", value_name = "FIELD=VALUE", help = "Equality filter (repeatable)")]
    filters: Vec<String>,
}

impl QueryArgs {
    fn query(&self) -> Result<Query, Error> {
        let mut query = Query::new(self.order.clone());
        if self.desc {
            query = query.descending();
        }
        for raw in &self.filters {
            let (field, value) = parse_filter(raw)?;
            query = query.with_filter(field, value);
        }
        Ok(query)
    }
}

impl RemoteArgs {
    fn collection(&self) -> Result<RemoteCollection, Error> {
        let mut client = RemoteClient::new(self.base_url.clone())?;
        if let Some(token) = &self.token {
            client = client.with_token(token.clone());
        }
        client.collection(self.collection.clone())
    }
}

fn parse_filter(raw: &str) -> Result<(String, String), Error> {
    match raw.split_once('=') {
        Some((field, value)) if !field.is_empty() => Ok((field.to_string(), value.to_string())),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid filter `{raw}`"))
            .with_hint("Use FIELD=VALUE, e.g. --filter team=7.")),
    }
}

fn parse_bind(raw: &str) -> Result<SocketAddr, Error> {
    raw.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9710.")
    })
}

/// Counts page requests so `browse` can report how many round trips it took.
struct CountingSource<S> {
    inner: S,
    fetches: AtomicUsize,
}

impl<S> CountingSource<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl<S: PageSource> PageSource for CountingSource<S> {
    fn fetch_page(
        &self,
        query: &Query,
        bounds: &RangeBounds,
        limit: u32,
    ) -> impl Future<Output = Result<Page, Error>> + Send {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.inner.fetch_page(query, bounds, limit)
    }
}

fn browse_cache(
    collection: RemoteCollection,
    limit: u32,
) -> PaginatedListCache<CountingSource<RemoteCollection>> {
    PaginatedListCache::with_options(
        CountingSource::new(collection),
        CacheOptions {
            limit,
            ..CacheOptions::default()
        },
    )
}

fn snapshot_json(snapshot: &ListSnapshot, pages: usize) -> Value {
    json!({
        "records": snapshot.records,
        "pagination": {
            "state": snapshot.state,
            "last": snapshot.last,
        },
        "pages": pages,
    })
}

fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

fn init_cli_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn add_transport_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::StoreUnavailable || err.hint().is_some() {
        return err;
    }
    err.with_hint("The server did not answer. Check the base URL and that `pagewise serve` is running.")
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint("Pass the server's bearer token with --token."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path and file permissions."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with --verbose and share command/context if it persists.",
    )
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_notice(notice: &Notice) {
    if io::stderr().is_terminal() {
        eprintln!("{}", notice.to_text());
        return;
    }
    eprintln!("{}", notice.to_json());
}

fn limited_notice(collection: &str, snapshot: &ListSnapshot) -> Notice {
    Notice::limited(
        "browse",
        collection,
        snapshot.records.len(),
        snapshot.last.clone(),
        notice_time_now().unwrap_or_default(),
    )
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::InvalidQuery => "invalid query".to_string(),
        ErrorKind::InvalidBound => "invalid bound".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::StoreUnavailable => "store unavailable".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(collection) = err.collection() {
        inner.insert("collection".to_string(), json!(collection));
    }
    if let Some(bound) = err.bound() {
        inner.insert("bound".to_string(), json!(bound));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(collection) = err.collection() {
        lines.push(format!("collection: {collection}"));
    }
    if let Some(bound) = err.bound() {
        lines.push(format!("bound: {bound}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `pagewise --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "pagewise") else {
        return "Try `pagewise --help`.".to_string();
    };
    let parts = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return "Try `pagewise --help`.".to_string();
    }
    format!("Try `pagewise {} --help`.", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::{Cli, parse_filter};
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn filters_split_on_the_first_equals() {
        assert_eq!(
            parse_filter("tag=a=b").expect("filter"),
            ("tag".to_string(), "a=b".to_string())
        );
        assert!(parse_filter("novalue").is_err());
        assert!(parse_filter("=x").is_err());
    }
}
