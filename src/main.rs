//! Purpose: `blockflight` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout (pretty when a terminal).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};

mod serve;

use blockflight::api::{Error, ErrorKind, ExportClient, to_exit_code};
use blockflight::core::maintenance::EngineConfig;
use blockflight::order_line::LoadConfig;

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
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
                let code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `blockflight --help`."));
            }
        },
    };

    match cli.command {
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
        }
        Command::Fetch { url, ratio } => {
            let client = ExportClient::new(url)?;
            if let Some(ratio) = ratio {
                client.set_policy_str(&ratio)?;
            }
            let mut stream = client.fetch()?;
            let columns: Vec<Value> = stream
                .schema()
                .fields()
                .iter()
                .map(|field| json!({ "name": field.name(), "type": field.data_type().to_string() }))
                .collect();
            let mut batch_rows = Vec::new();
            while let Some(batch) = stream.next_batch()? {
                batch_rows.push(batch.num_rows());
            }
            let rows: usize = batch_rows.iter().sum();
            emit_json(json!({
                "fetch": {
                    "columns": columns,
                    "batches": batch_rows.len(),
                    "rows": rows,
                    "batch_rows": batch_rows,
                }
            }));
        }
        Command::Policy { url, ratio } => {
            let client = ExportClient::new(url)?;
            let ratio = client.set_policy_str(&ratio)?;
            emit_json(json!({ "policy": { "ratio": ratio } }));
        }
        Command::Version => {
            emit_json(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }));
        }
    }
    Ok(0)
}

#[derive(Parser)]
#[command(
    name = "blockflight",
    version,
    about = "Export a live block store as an Arrow stream",
    after_help = r#"EXAMPLES
  $ blockflight serve
  $ blockflight policy 0.25
  $ blockflight fetch
  $ blockflight fetch --ratio 1"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Load the order_line fixture and serve it over HTTP",
        after_help = r#"NOTES
  - Loopback-only unless --allow-non-loopback is set
  - Background GC and compaction start before the first request
  - RUST_LOG controls log verbosity (default: info)"#
    )]
    Serve(ServeArgs),
    #[command(about = "Fetch the whole table and print a per-batch summary")]
    Fetch {
        #[arg(long, default_value = "http://127.0.0.1:9700", help = "Server base URL")]
        url: String,
        #[arg(long, help = "Set the sampling ratio before fetching")]
        ratio: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Set the probability that frozen blocks are materialized row by row"
    )]
    Policy {
        #[arg(long, default_value = "http://127.0.0.1:9700", help = "Server base URL")]
        url: String,
        #[arg(help = "Sampling ratio in [0, 1]")]
        ratio: String,
    },
    #[command(about = "Print version info as JSON")]
    Version,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:9700", help = "Address to bind")]
    bind: String,
    #[arg(long, help = "Allow binding to a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(long, default_value_t = 0.0, help = "Initial sampling ratio")]
    ratio: f64,
    #[arg(long, help = "Seed the block sampler for reproducible path choices")]
    seed: Option<u64>,
    #[arg(long, default_value_t = 1024, help = "Slots per block")]
    slots_per_block: u32,
    #[arg(long, default_value_t = 1, help = "Garbage collection period")]
    gc_period_ms: u64,
    #[arg(long, default_value_t = 10, help = "Compaction period")]
    compaction_period_ms: u64,
    #[arg(long, default_value_t = 10, help = "GC passes without writes before a block is compacted")]
    cold_after_gc_runs: u64,
    #[arg(long, default_value_t = 1, help = "Fixture warehouses")]
    warehouses: u8,
    #[arg(long, default_value_t = 10, help = "Fixture districts per warehouse")]
    districts: u8,
    #[arg(long, default_value_t = 300, help = "Fixture orders per district")]
    orders_per_district: u32,
    #[arg(long, default_value_t = 210, help = "Orders per district loaded as delivered")]
    delivered_through: u32,
    #[arg(long, default_value_t = 0x5eed, help = "Fixture generator seed")]
    fixture_seed: u64,
    #[arg(long, default_value_t = 1, help = "Delivery passes to run after startup")]
    delivery_rounds: usize,
    #[arg(long, default_value_t = 64 * 1024, help = "Maximum request body size")]
    max_body_bytes: u64,
    #[arg(long = "max-fetch-concurrency", default_value_t = 4, help = "Concurrent fetches allowed")]
    max_concurrent_fetches: usize,
}

fn serve_config_from_args(args: ServeArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9700.")
    })?;
    Ok(serve::ServeConfig {
        bind,
        allow_non_loopback: args.allow_non_loopback,
        max_body_bytes: args.max_body_bytes,
        max_concurrent_fetches: args.max_concurrent_fetches,
        initial_ratio: args.ratio,
        seed: args.seed,
        engine: EngineConfig {
            slots_per_block: args.slots_per_block,
            gc_period: Duration::from_millis(args.gc_period_ms),
            compaction_period: Duration::from_millis(args.compaction_period_ms),
            cold_after_gc_runs: args.cold_after_gc_runs,
        },
        fixture: LoadConfig {
            warehouses: args.warehouses,
            districts_per_warehouse: args.districts,
            orders_per_district: args.orders_per_district,
            delivered_through: args.delivered_through,
            seed: args.fixture_seed,
        },
        delivery_rounds: args.delivery_rounds,
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    println!(
        "{}",
        json.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    );
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

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::InvalidPolicy => "invalid sampling policy",
        ErrorKind::Visibility => "invalid read context",
        ErrorKind::ColumnAppend => "failed to append column value",
        ErrorKind::SchemaMismatch => "schema mismatch",
        ErrorKind::WriteConflict => "write conflict",
        ErrorKind::Busy => "resource is busy",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
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
    if let Some(block) = err.block() {
        inner.insert("block".to_string(), json!(block));
    }
    if let Some(slot) = err.slot() {
        inner.insert("slot".to_string(), json!(slot));
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
    if let Some(block) = err.block() {
        lines.push(format!("block: {block}"));
    }
    if let Some(slot) = err.slot() {
        lines.push(format!("slot: {slot}"));
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

#[cfg(test)]
mod tests {
    use super::{Cli, Command, clap_error_summary, error_json, serve_config_from_args};
    use blockflight::api::{Error, ErrorKind};
    use clap::Parser;

    #[test]
    fn serve_defaults_produce_valid_config() {
        let cli = Cli::try_parse_from(["blockflight", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = serve_config_from_args(args).expect("config");
        assert_eq!(config.bind.port(), 9700);
        assert_eq!(config.engine.slots_per_block, 1024);
        assert_eq!(config.engine.gc_period.as_millis(), 1);
        assert_eq!(config.engine.compaction_period.as_millis(), 10);
    }

    #[test]
    fn bad_bind_is_usage_error() {
        let cli = Cli::try_parse_from(["blockflight", "serve", "--bind", "nope"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let err = serve_config_from_args(args).err().expect("error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn error_json_carries_block_and_hint() {
        let err = Error::new(ErrorKind::ColumnAppend)
            .with_message("bad payload")
            .with_hint("check the writer")
            .with_block(4);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "ColumnAppend");
        assert_eq!(value["error"]["block"], 4);
        assert_eq!(value["error"]["hint"], "check the writer");
    }

    #[test]
    fn clap_summary_strips_prefix() {
        let err = Cli::try_parse_from(["blockflight", "policy", "--bogus"]).err().expect("error");
        assert!(!clap_error_summary(&err).starts_with("error:"));
    }
}
