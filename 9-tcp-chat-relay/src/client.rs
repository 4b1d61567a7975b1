use std::{
    io::{self, BufRead, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    connection::{ConnectionManager, is_system_notice},
};

/// How long the display thread waits for new text before rechecking for shutdown.
const DISPLAY_TICK: Duration = Duration::from_millis(100);

pub fn run(args: ClientArgs) -> Result<()> {
    let manager = Arc::new(ConnectionManager::with_framing(args.framing));
    manager
        .connect(&args.host, args.port)
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    write_stdout(&format!("*** connected to {}:{}", args.host, args.port))?;

    let stop = Arc::new(AtomicBool::new(false));
    let display = spawn_display(Arc::clone(&manager), Arc::clone(&stop))?;

    let outcome = run_input_loop(&manager, io::stdin().lock());

    stop.store(true, Ordering::SeqCst);
    if display.join().is_err() {
        warn!("display thread panicked");
    }
    manager.disconnect();

    outcome
}

fn run_input_loop(manager: &ConnectionManager, input: impl BufRead) -> Result<()> {
    for line in input.lines() {
        let line = line.context("failed to read stdin")?;
        let text = line.trim_end();
        if text.is_empty() {
            continue;
        }

        if text.eq_ignore_ascii_case("/quit") {
            write_stdout("*** leaving chat")?;
            break;
        }

        if let Err(error) = manager.send(text) {
            write_stderr(&format!("!!! failed to send message: {error}"))?;
            break;
        }
    }
    Ok(())
}

fn spawn_display(manager: Arc<ConnectionManager>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("chat-display".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let Some(text) = manager.receive_timeout(DISPLAY_TICK) else {
                    continue;
                };
                if let Err(error) = render(&text) {
                    warn!(?error, "failed to write to stdout");
                    break;
                }
            }
        })
        .context("failed to spawn display thread")
}

fn render(text: &str) -> io::Result<()> {
    if is_system_notice(text) {
        return write_stdout(&format!("*** {}", text.trim_end()));
    }
    for line in text.lines() {
        write_stdout(&format!("[remote] {line}"))?;
    }
    Ok(())
}

fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}

fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = io::stderr().lock();
    stderr.write_all(line.as_bytes())?;
    stderr.write_all(b"\n")?;
    stderr.flush()
}
