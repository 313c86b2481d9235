//! Latch script runner
//!
//! Evaluates script files against a bridge preloaded with the demo bindings:
//!
//! ```text
//! latch [--settings bridge.json] game.js [more.js ...]
//! ```
//!
//! Log output follows `RUST_LOG` and defaults to `info`.

mod demo;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use latch_script::{Bridge, BridgeSettings};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: latch [--settings <path>] <script.js>...";

#[derive(Debug, Default, PartialEq)]
struct Options {
    settings: Option<PathBuf>,
    scripts: Vec<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" | "-s" => {
                let path = args.next().context("--settings needs a path")?;
                options.settings = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("unknown option `{flag}`\n{USAGE}"),
            _ => options.scripts.push(PathBuf::from(arg)),
        }
    }
    Ok(options)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args(std::env::args().skip(1))?;
    if options.scripts.is_empty() {
        println!("{USAGE}");
        return Ok(());
    }

    let settings = match &options.settings {
        Some(path) => BridgeSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => BridgeSettings::default(),
    };
    tracing::debug!(settings = %serde_json::to_string(&settings)?, "bridge settings");

    let bridge = Bridge::with_settings(settings)?;
    demo::register(&bridge)?;
    tracing::info!("latch runner ready, {} script(s) queued", options.scripts.len());

    let mut failed = 0;
    for path in &options.scripts {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        match bridge.eval_void(&source) {
            Ok(()) => tracing::info!(script = %path.display(), "script finished"),
            Err(error) => {
                failed += 1;
                tracing::error!(script = %path.display(), fatal = error.is_fatal(), "{}", error.report());
            }
        }
    }

    bridge.run_gc();
    tracing::info!(
        boxes = bridge.box_count(),
        handles = bridge.handle_count(),
        stashed = bridge.stash_len(),
        "all scripts evaluated"
    );

    if failed > 0 {
        bail!("{failed} of {} script(s) failed", options.scripts.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn settings_flag_takes_a_path() {
        let options = parse_args(args(&["--settings", "bridge.json", "a.js", "b.js"])).unwrap();
        assert_eq!(options.settings, Some(PathBuf::from("bridge.json")));
        assert_eq!(options.scripts, [PathBuf::from("a.js"), PathBuf::from("b.js")]);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(parse_args(args(&["--fast", "a.js"])).is_err());
        assert!(parse_args(args(&["a.js", "--settings"])).is_err());
    }
}
