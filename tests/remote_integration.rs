//! Purpose: End-to-end tests for the HTTP export server and client.
//! Exports: None (integration test module).
//! Role: Validate fetch, policy updates and error propagation across TCP.
//! Invariants: Uses a loopback-only server with a small seeded fixture.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use blockflight::api::{ARROW_STREAM_CONTENT_TYPE, ErrorKind, ExportClient};
use blockflight::order_line::{self, LoadConfig};
use serde_json::Value;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

fn fixture() -> LoadConfig {
    LoadConfig {
        warehouses: 1,
        districts_per_warehouse: 2,
        orders_per_district: 20,
        delivered_through: 15,
        seed: 11,
    }
}

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start() -> TestResult<Self> {
        Self::start_with_args(&[])
    }

    fn start_with_args(extra: &[&str]) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let config = fixture();
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_blockflight"));
            command
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .arg("--seed")
                .arg("7")
                .arg("--slots-per-block")
                .arg("32")
                .arg("--compaction-period-ms")
                .arg("5")
                .arg("--cold-after-gc-runs")
                .arg("2")
                .arg("--warehouses")
                .arg(config.warehouses.to_string())
                .arg("--districts")
                .arg(config.districts_per_warehouse.to_string())
                .arg("--orders-per-district")
                .arg(config.orders_per_district.to_string())
                .arg("--delivered-through")
                .arg(config.delivered_through.to_string())
                .arg("--fixture-seed")
                .arg(config.seed.to_string())
                .args(extra)
                .env("RUST_LOG", "warn")
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
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

    fn client(&self) -> TestResult<ExportClient> {
        Ok(ExportClient::new(self.base_url.clone())?)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn expected_rows() -> usize {
    order_line::generate(&fixture()).len()
}

#[test]
fn remote_fetch_returns_every_row_in_layout_order() -> TestResult<()> {
    let server = TestServer::start()?;
    let client = server.client()?;
    client.health()?;

    let stream = client.fetch()?;
    let names: Vec<String> = stream
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();
    let layout = order_line::layout(32)?;
    let expected: Vec<String> = layout
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();
    assert_eq!(names, expected);

    let batches = stream.collect_batches()?;
    let rows: usize = batches.iter().map(|batch| batch.num_rows()).sum();
    assert_eq!(rows, expected_rows());
    assert!(batches.len() > 1);
    Ok(())
}

#[test]
fn remote_policy_change_keeps_row_count() -> TestResult<()> {
    let server = TestServer::start()?;
    let client = server.client()?;

    // Give the compactor a chance to freeze some blocks.
    sleep(Duration::from_millis(200));
    let before: usize = client
        .fetch()?
        .collect_batches()?
        .iter()
        .map(|batch| batch.num_rows())
        .sum();

    assert_eq!(client.set_policy(1.0)?, 1.0);
    let after: usize = client
        .fetch()?
        .collect_batches()?
        .iter()
        .map(|batch| batch.num_rows())
        .sum();
    assert_eq!(before, after);
    assert_eq!(after, expected_rows());

    assert_eq!(client.set_policy_str("0.25")?, 0.25);
    let policy: Value =
        serde_json::from_str(&ureq::get(&format!("{}/v0/policy", server.base_url)).call()?.into_string()?)?;
    assert_eq!(policy["ratio"], 0.25);
    Ok(())
}

#[test]
fn remote_invalid_policy_is_rejected() -> TestResult<()> {
    let server = TestServer::start()?;
    let client = server.client()?;

    let err = client.set_policy(1.5).expect_err("out of range");
    assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    assert!(err.hint().is_some());

    let err = client.set_policy_str("often").expect_err("not a number");
    assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    Ok(())
}

#[test]
fn remote_fetch_advertises_arrow_stream_headers() -> TestResult<()> {
    let server = TestServer::start_with_args(&["--ratio", "0.5"])?;
    let response = ureq::get(&format!("{}/v0/fetch", server.base_url)).call()?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("content-type"), Some(ARROW_STREAM_CONTENT_TYPE));
    assert!(response.header("blockflight-version").is_some());
    let rows: usize = response
        .header("blockflight-rows")
        .ok_or("missing rows header")?
        .parse()?;
    assert_eq!(rows, expected_rows());
    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;
    assert!(!body.is_empty());
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
