//! novon-ctl — viewer-side command-line client for a novond broadcaster.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

mod cmd;

use cmd::session::Session;

const DEFAULT_SERVER: &str = "127.0.0.1:30010";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

fn print_usage() {
    println!("Usage: novon-ctl [--server <addr>] [--timeout <secs>] <command>");
    println!();
    println!("Commands:");
    println!("  channelinfo                   Show viewers and quality levels");
    println!("  panels | getpanels            Show the channel panels");
    println!("  viewcount                     Show the number of viewers");
    println!("  ping                          Register as a viewer");
    println!("  disconnect                    Leave the viewer list");
    println!("  quality <tier>                Select a quality tier (0 = source)");
    println!("  donationid                    Request a donation id");
    println!("  chat <text> [--hash <tx>]     Post a chat message");
    println!("  thumbnail <out.jpg>           Save the latest thumbnail");
    println!("  watch <out.ts> [--quality <tier>] [--segments <n>]");
    println!("                                Receive the stream into a file");
    println!();
    println!("Options:");
    println!("  --server <addr>    Broadcaster address (default: {})", DEFAULT_SERVER);
    println!("  --timeout <secs>   Reply timeout (default: {})", DEFAULT_TIMEOUT_SECS);
}

/// Options that take a value, pulled out of the argument list.
#[derive(Default)]
struct Options {
    server: Option<String>,
    timeout: Option<u64>,
    hash: Option<String>,
    quality: Option<u32>,
    segments: Option<usize>,
}

fn parse_args(args: &[String]) -> Result<(Options, Vec<&str>)> {
    let mut opts = Options::default();
    let mut remaining = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .map(String::as_str)
                .with_context(|| format!("{flag} requires a value"))
        };
        match flag {
            "--server" => opts.server = Some(value()?.to_string()),
            "--timeout" => opts.timeout = Some(value()?.parse().context("--timeout must be a number")?),
            "--hash" => opts.hash = Some(value()?.to_string()),
            "--quality" => opts.quality = Some(value()?.parse().context("--quality must be a number")?),
            "--segments" => opts.segments = Some(value()?.parse().context("--segments must be a number")?),
            _ => remaining.push(flag),
        }
        i += 1;
    }
    Ok((opts, remaining))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (opts, remaining) = parse_args(&args)?;

    if matches!(remaining.as_slice(), [] | ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let server = opts.server.as_deref().unwrap_or(DEFAULT_SERVER);
    let timeout = Duration::from_secs(opts.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let session = Session::connect(server, timeout).await?;

    use cmd::{chat, control, watch};
    match remaining.as_slice() {
        ["channelinfo"]         => control::cmd_channel_info(&session).await,
        ["panels" | "getpanels"] => control::cmd_panels(&session).await,
        ["viewcount"]           => control::cmd_viewcount(&session).await,
        ["ping"]                => control::cmd_ping(&session).await,
        ["disconnect"]          => control::cmd_disconnect(&session).await,
        ["donationid"]          => control::cmd_donation_id(&session).await,
        ["quality", tier]       => {
            let tier = tier.parse().context("quality tier must be a number")?;
            control::cmd_quality(&session, tier).await
        }
        ["chat", text @ ..] if !text.is_empty() => {
            chat::cmd_chat(&session, &text.join(" "), opts.hash.as_deref().unwrap_or("")).await
        }
        ["thumbnail", out]      => control::cmd_thumbnail(&session, Path::new(out)).await,
        ["watch", out]          => watch::cmd_watch(&session, Path::new(out), opts.quality, opts.segments).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
