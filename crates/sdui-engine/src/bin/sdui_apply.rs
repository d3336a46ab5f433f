//! `sdui-apply` - apply one atomic action to a page definition.
//!
//! Usage:
//!   sdui-apply '<action-json>' [config.json]
//!
//! The page is read from stdin. Prints `{"result": ..., "tree": ...}`; exits
//! with status 2 when the action does not apply. Set `RUST_LOG=debug` for
//! engine logs on stderr.

use std::io::{self, Read, Write};
use std::process::exit;

use sdui_engine::{apply_action, AtomicAction, EngineConfig, PageDefinition};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(action) = args.get(1) else {
        fail("First argument must be an action JSON object.");
    };
    let action: AtomicAction = serde_json::from_str(action).unwrap_or_else(|e| fail(format!("bad action: {e}")));

    let config = match args.get(2) {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| fail(format!("{path}: {e}")));
            EngineConfig::from_json(&text).unwrap_or_else(|e| fail(e))
        }
        None => EngineConfig::default(),
    };

    let mut buf = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut buf) {
        fail(e);
    }
    let page: PageDefinition = serde_json::from_str(buf.trim()).unwrap_or_else(|e| fail(format!("bad page: {e}")));

    let outcome = apply_action(&page, &action, &config.apply_options());
    tracing::debug!(
        version = outcome.result.version,
        ops = outcome.delta.ops.len(),
        success = outcome.result.success,
        "applied"
    );
    let output = json!({ "result": outcome.result, "tree": outcome.tree });
    let text = serde_json::to_string_pretty(&output).unwrap_or_else(|e| fail(e));

    let mut stdout = io::stdout();
    if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.write_all(b"\n")) {
        fail(e);
    }
    if !outcome.result.success {
        exit(2);
    }
}
