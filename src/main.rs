//! Command shell driving the copy-on-write AVL index.
//!
//! Commands are whitespace-separated tokens:
//!
//! - `k <int>` inserts a key into the committed tree
//! - `s k <int>` probes a speculative insert and prints the visited keys,
//!   space-separated
//! - `r` discards the pending speculative branch
//!
//! Malformed input stops the shell with an error and a non-zero exit status.
//!
//! ```bash
//! echo "k 4 k 3 k 8 k 2 k 7 k 10 s k 5" | cow-avl
//! ```

use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cow_avl::AvlTree;

/// Ordered index shell: k <int> | s k <int> | r
#[derive(Parser, Debug)]
#[command(name = "cow-avl", version, about)]
struct Args {
    /// Read commands from a file instead of stdin.
    #[arg(short = 'f', long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Print the tree after every command.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let input = match &args.file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading commands from {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading commands from stdin")?;
            buf
        }
    };

    let mut tree: AvlTree<i64> = AvlTree::new();
    let mut out = String::new();
    let result = run_commands(&mut tree, &input, args.verbose, &mut out);
    print!("{out}");
    result
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("cow_avl=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn run_commands(
    tree: &mut AvlTree<i64>,
    input: &str,
    verbose: bool,
    out: &mut String,
) -> Result<()> {
    let mut tokens = input.split_whitespace();
    while let Some(command) = tokens.next() {
        match command {
            "k" => {
                let key = parse_key(tokens.next())?;
                tree.insert(key);
            }
            "s" => {
                match tokens.next() {
                    Some("k") => {}
                    _ => bail!("need detach command 'k' after 's'"),
                }
                let key = parse_key(tokens.next())?;
                for key in tree.detach_insert(key) {
                    let _ = write!(out, "{key} ");
                }
            }
            "r" => tree.reset(),
            other => bail!("unknown command {other:?}, need \"k\", \"s\" or \"r\""),
        }

        if verbose {
            let _ = writeln!(out, "{}", tree.dump());
        }
    }
    out.push('\n');
    Ok(())
}

fn parse_key(token: Option<&str>) -> Result<i64> {
    let token = token.context("need key as int")?;
    token
        .parse()
        .with_context(|| format!("invalid key {token:?}"))
}
