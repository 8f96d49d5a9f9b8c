use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use redline_protocol::{
    Command, EngagementState, ErrorCode, MAX_LINE_BYTES, Notification, Request, Response,
    ServerMessage,
};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

struct TestServer {
    dir: TempDir,
    socket_path: PathBuf,
    config_path: PathBuf,
    child: Child,
}

impl TestServer {
    async fn spawn() -> Result<Self> {
        Self::spawn_with_config("").await
    }

    async fn spawn_with_config(extra: &str) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        Self::launch(dir, extra).await
    }

    /// Start a daemon over an existing state directory.
    async fn launch(dir: TempDir, extra: &str) -> Result<Self> {
        let socket_path = dir.path().join("run/redline.sock");
        let config_path = dir.path().join("redline.toml");
        fs::write(&config_path, render_config(dir.path(), extra))?;

        let child = std::process::Command::new(assert_cmd::cargo::cargo_bin!("redline-daemon"))
            .arg("--socket")
            .arg(&socket_path)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn redline-daemon")?;

        let start = Instant::now();
        loop {
            if socket_path.exists() && UnixStream::connect(&socket_path).await.is_ok() {
                break;
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("timed out waiting for socket {}", socket_path.display());
            }
            sleep(Duration::from_millis(20)).await;
        }

        Ok(Self {
            dir,
            socket_path,
            config_path,
            child,
        })
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    async fn client(&self) -> Result<ProtocolClient> {
        ProtocolClient::connect(&self.socket_path).await
    }

    async fn wait_for_exit(&mut self) -> Result<i32> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                return status.code().ok_or_else(|| anyhow!("terminated by signal"));
            }
            if start.elapsed() > Duration::from_secs(10) {
                bail!("daemon did not exit");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn render_config(dir: &Path, extra: &str) -> String {
    format!(
        "runtime_dir = \"{}\"\nstate_dir = \"{}\"\n{extra}\n",
        dir.join("run").display(),
        dir.join("state").display()
    )
}

struct ProtocolClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    notifications: Vec<Notification>,
}

impl ProtocolClient {
    async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect {}", socket_path.display()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            notifications: Vec::new(),
        })
    }

    async fn send_line(&mut self, line: String) -> Result<()> {
        self.writer.send(line).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<ServerMessage> {
        let next = timeout(Duration::from_secs(5), self.reader.next())
            .await
            .context("timed out waiting for the daemon")?;
        let Some(line) = next else {
            bail!("server disconnected");
        };
        Ok(ServerMessage::decode(&line?)?)
    }

    /// Next response, stashing any notifications that arrive first.
    async fn next_response(&mut self) -> Result<Response> {
        loop {
            match self.next_message().await? {
                ServerMessage::Response(resp) => return Ok(resp),
                ServerMessage::Notification(n) => self.notifications.push(n),
            }
        }
    }

    async fn next_notification(&mut self) -> Result<Notification> {
        if !self.notifications.is_empty() {
            return Ok(self.notifications.remove(0));
        }
        loop {
            match self.next_message().await? {
                ServerMessage::Notification(n) => return Ok(n),
                ServerMessage::Response(resp) => bail!("unexpected response {resp:?}"),
            }
        }
    }

    async fn request(&mut self, req: Request) -> Result<Response> {
        let id = req.id.clone();
        self.send_line(req.to_line()?).await?;
        let resp = self.next_response().await?;
        if resp.id != id {
            bail!("response id {} does not match request id {id}", resp.id);
        }
        Ok(resp)
    }

    async fn request_ok(&mut self, req: Request) -> Result<serde_json::Map<String, Value>> {
        let resp = self.request(req).await?;
        if !resp.is_ok() {
            bail!("request failed: {:?} {:?}", resp.code, resp.error);
        }
        resp.data.ok_or_else(|| anyhow!("missing data"))
    }

    async fn start(&mut self, config: &str) -> Result<String> {
        let data = self
            .request_ok(Request::for_command(Command::EngagementStart).with_param("config", config))
            .await?;
        data["engagement_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing engagement_id"))
    }

    async fn act(&mut self, command: Command, id: &str) -> Result<Response> {
        self.request(Request::for_command(command).with_param("engagement_id", id))
            .await
    }
}

fn state_of(resp: &Response) -> Option<EngagementState> {
    serde_json::from_value(resp.data.as_ref()?.get("state")?.clone()).ok()
}

#[tokio::test]
async fn engagement_lifecycle_over_the_socket() -> Result<()> {
    let server = TestServer::spawn().await?;
    let mut client = server.client().await?;

    let id = client.start("/etc/redline/ministry.toml").await?;
    assert!(id.starts_with("ministry-"), "{id}");

    let list = client
        .request_ok(Request::for_command(Command::SessionsList))
        .await?;
    let engagements = list["engagements"].as_array().expect("engagements array");
    assert_eq!(engagements.len(), 1);
    assert_eq!(engagements[0]["id"], id.as_str());
    assert_eq!(engagements[0]["state"], "RUNNING");

    for (command, expected) in [
        (Command::EngagementPause, EngagementState::Paused),
        (Command::EngagementResume, EngagementState::Running),
        (Command::EngagementStop, EngagementState::Stopped),
        (Command::EngagementComplete, EngagementState::Completed),
    ] {
        let resp = client.act(command, &id).await?;
        assert!(resp.is_ok(), "{command}: {resp:?}");
        assert_eq!(state_of(&resp), Some(expected));
    }

    let removed = client
        .request_ok(Request::for_command(Command::EngagementRemove).with_param("engagement_id", id.as_str()))
        .await?;
    assert_eq!(removed["removed"], true);
    Ok(())
}

#[tokio::test]
async fn capacity_limit_is_enforced() -> Result<()> {
    let server = TestServer::spawn_with_config("max_engagements = 2").await?;
    let mut client = server.client().await?;

    client.start("alpha.toml").await?;
    client.start("bravo.toml").await?;
    let resp = client
        .request(Request::for_command(Command::EngagementStart).with_param("config", "charlie.toml"))
        .await?;
    assert_eq!(resp.code, Some(ErrorCode::CapacityExceeded));
    let data = resp.data.expect("error context");
    assert_eq!(data["active"], 2);
    assert_eq!(data["max_engagements"], 2);
    Ok(())
}

#[tokio::test]
async fn protocol_errors_are_answered_and_the_connection_survives() -> Result<()> {
    let server = TestServer::spawn().await?;
    let mut client = server.client().await?;

    client.send_line("not valid text".to_string()).await?;
    let resp = client.next_response().await?;
    assert_eq!(resp.code, Some(ErrorCode::MalformedMessage));

    client
        .send_line(r#"{"command":"engagement.explode","params":{},"id":"req-7"}"#.to_string())
        .await?;
    let resp = client.next_response().await?;
    assert_eq!(resp.code, Some(ErrorCode::UnknownCommand));
    assert_eq!(resp.id, "req-7");

    let resp = client.act(Command::EngagementPause, "ghost").await?;
    assert_eq!(resp.code, Some(ErrorCode::NotFound));

    let resp = client
        .request(Request::for_command(Command::EngagementPause))
        .await?;
    assert_eq!(resp.code, Some(ErrorCode::InvalidParams));

    let id = client.start("delta.toml").await?;
    let resp = client.act(Command::EngagementResume, &id).await?;
    assert_eq!(resp.code, Some(ErrorCode::InvalidTransition));
    let data = resp.data.expect("error context");
    assert_eq!(data["current"], "RUNNING");
    assert_eq!(data["requested"], "RUNNING");
    Ok(())
}

#[tokio::test]
async fn attached_clients_receive_state_changes() -> Result<()> {
    let server = TestServer::spawn().await?;
    let mut operator = server.client().await?;
    let mut watcher = server.client().await?;

    let id = operator.start("echo.toml").await?;
    let attached = watcher
        .request_ok(Request::for_command(Command::EngagementAttach).with_param("engagement_id", id.as_str()))
        .await?;
    assert_eq!(attached["engagement"]["state"], "RUNNING");

    operator.act(Command::EngagementPause, &id).await?;
    match watcher.next_notification().await? {
        Notification::StateChanged {
            engagement_id,
            from,
            to,
            ..
        } => {
            assert_eq!(engagement_id, id);
            assert_eq!(from, EngagementState::Running);
            assert_eq!(to, EngagementState::Paused);
        }
        other => panic!("unexpected notification {other:?}"),
    }

    let detached = watcher
        .request_ok(Request::for_command(Command::EngagementDetach).with_param("engagement_id", id.as_str()))
        .await?;
    assert_eq!(detached["detached"], 1);
    let resp = watcher.act(Command::EngagementDetach, &id).await?;
    assert_eq!(resp.code, Some(ErrorCode::NotAttached));
    Ok(())
}

#[tokio::test]
async fn kill_switch_freezes_until_reset() -> Result<()> {
    let server = TestServer::spawn().await?;
    let mut client = server.client().await?;
    let id = client.start("foxtrot.toml").await?;

    let result = client
        .request_ok(
            Request::for_command(Command::DaemonKill)
                .with_param("reason", "scope breach")
                .with_param("actor", "alice"),
        )
        .await?;
    assert!(result["duration_ms"].as_u64().expect("duration") < 1000);
    assert_eq!(result["actor"], "alice");

    let status = client
        .request_ok(Request::for_command(Command::DaemonStatus))
        .await?;
    assert_eq!(status["frozen"], true);

    let resp = client.act(Command::EngagementResume, &id).await?;
    assert_eq!(resp.code, Some(ErrorCode::Halted));
    let resp = client
        .request(Request::for_command(Command::EngagementStart).with_param("config", "golf.toml"))
        .await?;
    assert_eq!(resp.code, Some(ErrorCode::Halted));

    let reset = client
        .request_ok(Request::for_command(Command::DaemonKillReset).with_param("actor", "alice"))
        .await?;
    assert_eq!(reset["was_frozen"], true);
    let resp = client.act(Command::EngagementResume, &id).await?;
    assert_eq!(state_of(&resp), Some(EngagementState::Running));

    let audit = fs::read_to_string(server.state_dir().join("audit.jsonl"))?;
    assert_eq!(audit.lines().count(), 1);
    Ok(())
}

#[tokio::test]
async fn config_reload_applies_new_limits() -> Result<()> {
    let server = TestServer::spawn_with_config("max_engagements = 1").await?;
    let mut client = server.client().await?;
    client.start("hotel.toml").await?;

    fs::write(
        &server.config_path,
        render_config(server.dir.path(), "max_engagements = 2"),
    )?;
    let reloaded = client
        .request_ok(Request::for_command(Command::DaemonConfigReload))
        .await?;
    assert_eq!(reloaded["limits"]["max_engagements"], 2);
    client.start("india.toml").await?;
    Ok(())
}

#[tokio::test]
async fn daemon_stop_checkpoints_and_exits_cleanly() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.client().await?;

    let running = client.start("juliet.toml").await?;
    let paused = client.start("kilo.toml").await?;
    client.act(Command::EngagementPause, &paused).await?;
    client
        .request_ok(Request::for_command(Command::EngagementAttach).with_param("engagement_id", running.as_str()))
        .await?;

    let stopping = client
        .request_ok(Request::for_command(Command::DaemonStop).with_param("reason", "maintenance"))
        .await?;
    assert_eq!(stopping["stopping"], true);

    let mut saw_shutdown = false;
    while let Ok(n) = client.next_notification().await {
        if let Notification::Shutdown { reason, .. } = n {
            assert_eq!(reason, "maintenance");
            saw_shutdown = true;
            break;
        }
    }
    assert!(saw_shutdown, "no shutdown notification");

    assert_eq!(server.wait_for_exit().await?, 0);
    assert!(!server.socket_path.exists());
    for id in [&running, &paused] {
        let checkpoint = server
            .state_dir()
            .join("engagements")
            .join(id)
            .join("checkpoint.json");
        let raw = fs::read_to_string(&checkpoint)
            .with_context(|| format!("missing {}", checkpoint.display()))?;
        let value: Value = serde_json::from_str(&raw)?;
        assert_eq!(value["engagement"]["id"], id.as_str());
    }
    Ok(())
}

#[tokio::test]
async fn halt_key_is_persisted_and_reported() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.client().await?;
    let status = client
        .request_ok(Request::for_command(Command::DaemonStatus))
        .await?;
    let first_key = status["halt_public_key"]
        .as_str()
        .context("status is missing halt_public_key")?
        .to_string();
    assert!(!first_key.is_empty());

    let key_path = server.state_dir().join("halt.key");
    let mode = std::os::unix::fs::PermissionsExt::mode(&fs::metadata(&key_path)?.permissions());
    assert_eq!(mode & 0o777, 0o600);

    client
        .request_ok(Request::for_command(Command::DaemonStop))
        .await?;
    assert_eq!(server.wait_for_exit().await?, 0);
    drop(client);

    let dir = std::mem::replace(&mut server.dir, tempfile::tempdir()?);
    let restarted = TestServer::launch(dir, "").await?;
    let mut client = restarted.client().await?;
    let status = client
        .request_ok(Request::for_command(Command::DaemonStatus))
        .await?;
    assert_eq!(status["halt_public_key"], first_key.as_str());
    Ok(())
}

#[tokio::test]
async fn sigterm_triggers_graceful_exit() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.client().await?;
    client.start("lima.toml").await?;

    let status = std::process::Command::new("kill")
        .args(["-TERM", &server.child.id().to_string()])
        .status()
        .context("failed to run kill")?;
    assert!(status.success());

    assert_eq!(server.wait_for_exit().await?, 0);
    Ok(())
}
