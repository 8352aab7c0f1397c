// Terminal listener: tunes into a station and keeps a simulated deck in step
// with it. Reads one command per line from stdin.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use stationsync::client::{self, Command, HttpRadioApi, SimulatedEngine};
use stationsync::config::ListenerConfig;
use stationsync::track::fmt_dur_mmss;

const HELP: &str = "commands: play | pause | track <id> | live | vol <0..1> | list | reload | status | quit";

/// Simulated fetch/decode latency of the local deck.
const LOAD_DELAY: Duration = Duration::from_millis(150);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = ListenerConfig::from_env();
    info!(server = %config.server_url, poll = ?config.poll_interval, "tuning in");

    let api = Arc::new(HttpRadioApi::new(config.server_url.clone(), config.request_timeout)?);
    let (engine, events) = SimulatedEngine::new(LOAD_DELAY);
    let (tx, rx) = mpsc::channel(16);
    let listener = tokio::spawn(client::run(api, engine, events, rx, config));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "status" => print_status(&tx, false).await,
            "list" => print_status(&tx, true).await,
            "help" => println!("{HELP}"),
            _ => match parse_command(line) {
                Some(cmd) => {
                    let quit = matches!(cmd, Command::Quit);
                    if tx.send(cmd).await.is_err() || quit {
                        break;
                    }
                }
                None => warn!("unknown command {line:?}; {HELP}"),
            },
        }
    }

    drop(tx);
    listener.await?;
    Ok(())
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let cmd = match (parts.next()?, parts.next()) {
        ("play" | "pause" | "p", None) => Command::TogglePlay,
        ("track" | "t", Some(id)) => Command::PlayTrack(id.to_string()),
        ("live" | "l", None) => Command::GoLive,
        ("vol" | "v", Some(v)) => Command::SetVolume(v.parse().ok()?),
        ("reload", None) => Command::RefreshPlaylist,
        ("quit" | "q" | "exit", None) => Command::Quit,
        _ => return None,
    };
    Some(cmd)
}

async fn print_status(tx: &mpsc::Sender<Command>, with_playlist: bool) {
    let Some(status) = client::query_status(tx, Duration::from_secs(1)).await else {
        warn!("listener is not responding");
        return;
    };
    match &status.track {
        Some(track) => println!(
            "{:?}  {} ({})  {} / {}  vol {:.2}",
            status.state,
            track.title,
            track.id,
            fmt_dur_mmss(status.position),
            fmt_dur_mmss(track.duration),
            status.volume
        ),
        None => println!("{:?}  nothing loaded  vol {:.2}", status.state, status.volume),
    }
    if with_playlist {
        for (i, track) in status.playlist.iter().enumerate() {
            let marker = if status.track.as_ref().is_some_and(|t| t.id == track.id) { ">" } else { " " };
            println!("{marker} {:>2}. {:<24} {:<20} {}", i + 1, track.id, track.title, fmt_dur_mmss(track.duration));
        }
    }
}
