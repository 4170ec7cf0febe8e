//! Purpose: End-to-end tests for the HTTP page server, remote client and list cache.
//! Exports: None (integration test module).
//! Role: Validate paging, bounds, error propagation and cache behavior across TCP.
//! Invariants: Uses a loopback-only server over a temp catalog.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use pagewise::api::{
    CacheOptions, ErrorKind, PaginatedListCache, PaginationState, Query, RangeBounds,
    RemoteClient, Record,
};
use serde_json::{Value, json};
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    token: Option<String>,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(catalog: &Path) -> TestResult<Self> {
        Self::start_with_token(catalog, None)
    }

    fn start_with_token(catalog: &Path, token: Option<&str>) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_pagewise"));
            command
                .arg("serve")
                .arg("--catalog")
                .arg(catalog)
                .arg("--bind")
                .arg(&bind)
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(token) = token {
                command.arg("--token").arg(token);
            }
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        token: token.map(str::to_string),
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn client(&self) -> TestResult<RemoteClient> {
        Ok(RemoteClient::new(self.base_url.clone())?)
    }

    fn client_with_token(&self) -> TestResult<RemoteClient> {
        let mut client = RemoteClient::new(self.base_url.clone())?;
        if let Some(token) = &self.token {
            client = client.with_token(token.clone());
        }
        Ok(client)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn day(d: u32) -> String {
    format!("2024-01-{d:02}T00:00:00Z")
}

/// Catalog with 25 January events, plus a retention-limited view of the same records.
fn write_catalog(dir: &Path) -> TestResult<PathBuf> {
    let mut seed = String::new();
    for d in 1..=25u32 {
        let record = json!({
            "id": format!("e{d:02}"),
            "data": {
                "created_at": day(d),
                "rank": d,
                "team": if d % 2 == 1 { "a" } else { "b" },
            },
        });
        seed.push_str(&record.to_string());
        seed.push('\n');
    }
    std::fs::write(dir.join("events.jsonl"), seed)?;

    let catalog = json!({"collections": [
        {
            "name": "events",
            "fields": {"created_at": "timestamp", "rank": "integer"},
            "filters": ["team"],
            "default_limit": 10,
            "max_limit": 50,
            "records": "events.jsonl",
        },
        {
            "name": "recent",
            "fields": {"created_at": "timestamp"},
            "retention": {"field": "created_at", "not_before": day(20)},
            "records": "events.jsonl",
        },
    ]});
    let path = dir.join("catalog.json");
    std::fs::write(&path, catalog.to_string())?;
    Ok(path)
}

fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|record| record.id.clone()).collect()
}

#[test]
fn remote_pages_chain_through_after() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let events = server.client()?.collection("events")?;
    let query = Query::new("created_at");

    let first = events.fetch(&query, &RangeBounds::none(), 10)?;
    assert_eq!(first.records.len(), 10);
    assert_eq!(first.state, PaginationState::Continue);
    assert_eq!(first.last.as_deref(), Some(day(10).as_str()));
    assert!(first.state_at.is_some());

    let second = events.fetch(&query, &RangeBounds::after(day(10)), 10)?;
    assert_eq!(second.records[0].id, "e11");
    assert_eq!(second.state, PaginationState::Continue);

    let third = events.fetch(&query, &RangeBounds::after(day(20)), 10)?;
    assert_eq!(ids(&third.records), ["e21", "e22", "e23", "e24", "e25"]);
    assert_eq!(third.state, PaginationState::End);
    assert_eq!(third.last.as_deref(), Some(day(25).as_str()));

    let empty = events.fetch(&query, &RangeBounds::after(day(25)), 10)?;
    assert!(empty.records.is_empty());
    assert_eq!(empty.state, PaginationState::End);
    assert_eq!(empty.last.as_deref(), Some(day(25).as_str()));
    Ok(())
}

#[test]
fn remote_before_walks_backward_and_filters_apply() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let events = server.client()?.collection("events")?;

    let page = events.fetch(
        &Query::new("created_at"),
        &RangeBounds::before(day(10)),
        3,
    )?;
    assert_eq!(ids(&page.records), ["e07", "e08", "e09"]);
    assert_eq!(page.state, PaginationState::Continue);
    assert_eq!(page.last.as_deref(), Some(day(7).as_str()));

    let page = events.fetch(
        &Query::new("rank").descending().with_filter("team", "b"),
        &RangeBounds::none(),
        3,
    )?;
    assert_eq!(ids(&page.records), ["e24", "e22", "e20"]);
    assert_eq!(page.last.as_deref(), Some("20"));
    Ok(())
}

#[test]
fn remote_errors_preserve_kinds() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let client = server.client()?;
    let events = client.collection("events")?;

    let err = events
        .fetch(&Query::new("created_at"), &RangeBounds::after("yesterday"), 5)
        .expect_err("bad bound");
    assert_eq!(err.kind(), ErrorKind::InvalidBound);
    assert_eq!(err.bound(), Some("yesterday"));
    assert_eq!(err.collection(), Some("events"));

    let err = events
        .fetch(&Query::new("title"), &RangeBounds::none(), 5)
        .expect_err("bad order");
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);

    let err = client
        .collection("missing")?
        .fetch(&Query::new("created_at"), &RangeBounds::none(), 5)
        .expect_err("missing collection");
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let defaulted = events.fetch(&Query::new("created_at"), &RangeBounds::none(), 0)?;
    assert_eq!(defaulted.records.len(), 10);

    let clamped = events.fetch(&Query::new("created_at"), &RangeBounds::none(), 500)?;
    assert_eq!(clamped.records.len(), 25);
    assert_eq!(clamped.state, PaginationState::End);
    Ok(())
}

#[test]
fn remote_retention_reports_limited() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let recent = server.client()?.collection("recent")?;

    let page = recent.fetch(
        &Query::new("created_at").descending(),
        &RangeBounds::none(),
        10,
    )?;
    assert_eq!(ids(&page.records), ["e25", "e24", "e23", "e22", "e21", "e20"]);
    assert_eq!(page.state, PaginationState::Limited);
    Ok(())
}

#[test]
fn remote_requires_token_when_configured() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start_with_token(&write_catalog(temp_dir.path())?, Some("s3cret"))?;

    let err = server
        .client()?
        .collections()
        .expect_err("missing token");
    assert_eq!(err.kind(), ErrorKind::Permission);

    let collections = server.client_with_token()?.collections()?;
    let names = collections
        .iter()
        .map(|info| info.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, ["events", "recent"]);
    assert_eq!(collections[0].records, 25);
    Ok(())
}

#[test]
fn appends_are_hidden_from_pinned_reads() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let events = server.client()?.collection("events")?;
    let query = Query::new("created_at");

    let first = events.fetch(&query, &RangeBounds::none(), 5)?;
    let pinned = first.state_at.ok_or("first page carries state_at")?;

    let record: Record = serde_json::from_value(json!({
        "id": "late",
        "data": {"created_at": "2024-01-05T12:00:00Z", "rank": 99},
    }))?;
    let receipt = events.append(vec![record])?;
    assert_eq!(receipt.inserted, 1);
    assert!(receipt.state_at > pinned);

    let live = events.fetch(&query, &RangeBounds::after(day(5)), 1)?;
    assert_eq!(live.records[0].id, "late");

    let pinned_page = events.fetch(&query.clone().at_state(pinned), &RangeBounds::after(day(5)), 1)?;
    assert_eq!(pinned_page.records[0].id, "e06");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_cache_loads_incrementally_over_http() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;
    let events = server.client()?.collection("events")?;
    let cache = PaginatedListCache::with_options(
        events.clone(),
        CacheOptions {
            limit: 10,
            ..CacheOptions::default()
        },
    );
    let query = Query::new("created_at").descending();

    let first = cache.load(&query).await?;
    assert_eq!(first.records.len(), 10);
    assert_eq!(first.records[0].id, "e25");

    let second = cache.load_more(&query).await?;
    let third = cache.load_more(&query).await?;
    assert_eq!(second.records.len(), 20);
    assert_eq!(third.records.len(), 25);
    assert_eq!(third.state, Some(PaginationState::End));
    assert_eq!(third.records[24].id, "e01");

    let record: Record = serde_json::from_value(json!({
        "id": "newest",
        "data": {"created_at": "2024-02-01T00:00:00Z", "rank": 100},
    }))?;
    events.append(vec![record])?;

    let refreshed = cache.refresh(&query).await?;
    assert_eq!(refreshed.records.len(), 10);
    assert_eq!(refreshed.records[0].id, "newest");
    assert_eq!(refreshed.state, Some(PaginationState::Continue));
    Ok(())
}

#[test]
fn browse_command_drives_the_list_cache() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;

    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args([
            "browse",
            &server.base_url,
            "events",
            "--order",
            "created_at",
            "--limit",
            "10",
            "--pages",
            "2",
        ])
        .output()?;
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["records"].as_array().map(Vec::len), Some(20));
    assert_eq!(value["pagination"]["state"], "CONTINUE");
    assert_eq!(value["pagination"]["last"], day(20));
    assert_eq!(value["pages"], 2);

    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args([
            "browse",
            &server.base_url,
            "events",
            "--order",
            "created_at",
            "--limit",
            "10",
            "--period",
            "month",
        ])
        .output()?;
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["records"].as_array().map(Vec::len), Some(25));
    assert_eq!(value["pagination"]["state"], "END");
    assert_eq!(value["pages"], 3);
    Ok(())
}

#[test]
fn browse_emits_notice_when_limited() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;

    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args([
            "browse",
            &server.base_url,
            "recent",
            "--order",
            "created_at",
            "--desc",
        ])
        .output()?;
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["pagination"]["state"], "LIMITED");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let notice: Value = serde_json::from_str(stderr.lines().next().ok_or("notice line")?)?;
    assert_eq!(notice["notice"]["kind"], "limited");
    assert_eq!(notice["notice"]["collection"], "recent");
    assert_eq!(notice["notice"]["details"]["returned"], 6);
    Ok(())
}

#[test]
fn fetch_and_append_commands_speak_the_wire_contract() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(&write_catalog(temp_dir.path())?)?;

    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args([
            "fetch",
            &server.base_url,
            "events",
            "--order",
            "rank",
            "--desc",
            "--limit",
            "2",
            "--filter",
            "team=a",
        ])
        .output()?;
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["records"][0]["id"], "e25");
    assert_eq!(value["records"][1]["id"], "e23");
    assert_eq!(value["pagination"]["state"], "CONTINUE");
    assert_eq!(value["pagination"]["last"], "23");

    let file = temp_dir.path().join("more.jsonl");
    std::fs::write(
        &file,
        "{\"id\":\"x1\",\"data\":{\"created_at\":\"2024-03-01T00:00:00Z\",\"rank\":1}}\n",
    )?;
    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args(["append", &server.base_url, "events", "--file"])
        .arg(&file)
        .output()?;
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["inserted"], 1);

    let output = Command::new(env!("CARGO_BIN_EXE_pagewise"))
        .args([
            "fetch",
            &server.base_url,
            "events",
            "--order",
            "created_at",
            "--after",
            "not-a-time",
        ])
        .output()?;
    assert_eq!(output.status.code(), Some(4));
    let err: Value = serde_json::from_slice(&output.stderr)?;
    assert_eq!(err["error"]["kind"], "InvalidBound");
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
