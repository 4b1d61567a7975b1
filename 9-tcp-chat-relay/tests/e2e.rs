use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("tcp-chat-relay");

    let (mut server_child, mut server_log) = spawn_server(&binary).await?;
    let port = read_server_port(&mut server_log).await?;

    let mut alice = spawn_client(&binary, port).await?;
    let mut bob = spawn_client(&binary, port).await?;

    // Both clients must be registered before anyone speaks.
    wait_for_log(&mut server_log, "client connected", 2).await?;
    let server_log_task = tokio::spawn(async move {
        drain_lines(server_log).await;
    });

    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "[remote] Hello from Alice");

    bob.send_line("Hi Alice!").await.context("bob send line")?;
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "[remote] Hi Alice!");

    alice.send_line("/quit").await.context("alice send quit")?;
    let alice_quit =
        read_line_expect(&mut alice.stdout, "waiting for alice quit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");
    ensure_success(&mut alice.child, "alice client").await?;

    // Stopping the server surfaces a system notice in the remaining client.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let bob_notice = read_line_expect(&mut bob.stdout, "waiting for bob disconnect notice").await?;
    assert!(
        bob_notice.starts_with("*** [SYSTEM]"),
        "unexpected notice: {bob_notice}"
    );

    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_quit = read_line_expect(&mut bob.stdout, "waiting for bob quit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");
    ensure_success(&mut bob.child, "bob client").await?;

    let _ = server_log_task.await;

    Ok(())
}

#[tokio::test]
async fn client_fails_without_a_server() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("tcp-chat-relay");
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let status = Command::new(&binary)
        .arg("client")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to run client")?;

    assert!(!status.success(), "client should fail when nothing listens");
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStderr>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--bind")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stderr = child
        .stderr
        .take()
        .context("server stderr missing after spawn")?;

    Ok((child, BufReader::new(stderr)))
}

async fn read_server_port(reader: &mut BufReader<ChildStderr>) -> Result<u16> {
    let line = read_line(reader)
        .await?
        .context("server did not log its listening address")?;
    let trimmed = line.trim();
    if !trimmed.contains("server listening on") {
        return Err(anyhow!("unexpected server banner: {trimmed}"));
    }
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    let (_, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("server banner missing port: {trimmed}"))?;
    port.parse()
        .with_context(|| format!("invalid port in banner: {trimmed}"))
}

async fn wait_for_log(
    reader: &mut BufReader<ChildStderr>,
    needle: &str,
    occurrences: usize,
) -> Result<()> {
    let mut seen = 0;
    while seen < occurrences {
        let line = read_line(reader)
            .await?
            .with_context(|| format!("server log ended before '{needle}' appeared"))?;
        if line.contains(needle) {
            seen += 1;
        }
    }
    Ok(())
}

async fn spawn_client(binary: &Path, port: u16) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected to 127.0.0.1:{port}") {
        return Err(anyhow!("unexpected connect banner: '{banner}'"));
    }

    Ok(process)
}

async fn read_line_expect<R>(reader: &mut BufReader<R>, description: &str) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes_io = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes_io? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_lines<R>(mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = String::new();
    while matches!(reader.read_line(&mut buffer).await, Ok(bytes) if bytes > 0) {
        buffer.clear();
    }
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("timed out waiting for {name} to exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
