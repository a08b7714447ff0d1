//! Bot process execution.
//!
//! `spawn_bot` starts one bot as a child process, forwards its output to the
//! fleet event channel and completes the returned `BotHandle` when the child
//! exits. It also owns the OS signal plumbing used to interrupt bots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::bot::{BotExit, BotHandle, ConnectRequest};
use crate::events::{Event, ProcessSignal};
use crate::output::StreamKind;

/// A fully rendered bot command.
#[derive(Debug, Clone)]
pub struct BotCommand {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl BotCommand {
    /// Renders `template` for one bot and attaches the bot environment.
    pub fn render(
        template: &str,
        channel: &str,
        cwd: PathBuf,
        extra_env: &HashMap<String, String>,
        request: &ConnectRequest,
    ) -> Result<Self> {
        let rendered = template
            .replace("{index}", &request.index.to_string())
            .replace("{total}", &request.total.to_string())
            .replace("{channel}", channel)
            .replace("{client}", &request.client_kind)
            .replace("{query}", request.query.as_deref().unwrap_or(""));
        let mut parts = shell_words::split(&rendered)
            .with_context(|| format!("failed to parse bot command for {}", channel))?;
        if parts.is_empty() {
            return Err(anyhow!("empty bot command for {}", channel));
        }
        let cmd = parts.remove(0);

        let mut env = extra_env.clone();
        env.insert("BOTRACK_INDEX".into(), request.index.to_string());
        env.insert("BOTRACK_TOTAL".into(), request.total.to_string());
        env.insert("BOTRACK_CHANNEL".into(), channel.to_string());
        env.insert("BOTRACK_CLIENT_KIND".into(), request.client_kind.clone());
        if let Some(query) = &request.query {
            env.insert("BOTRACK_QUERY".into(), query.clone());
        }
        if let Some(auth) = request.credential.to_env_value() {
            env.insert("BOTRACK_AUTH".into(), auth);
        }

        Ok(Self {
            cmd,
            args: parts,
            cwd,
            env,
        })
    }
}

/// Spawns one bot.
///
/// Returns as soon as the child is running. Output lines are sent as
/// `Event::BotOutput`; the handle completes once the child has exited and
/// both of its output streams are closed.
pub fn spawn_bot(
    index: usize,
    command: &BotCommand,
    event_tx: mpsc::Sender<Event>,
) -> Result<BotHandle> {
    let mut child_cmd = Command::new(&command.cmd);
    child_cmd
        .args(&command.args)
        .current_dir(&command.cwd)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        child_cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        child_cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = child_cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", command.cmd))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_stream(index, StreamKind::Stdout, stdout, event_tx.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_stream(index, StreamKind::Stderr, stderr, event_tx)));

    let (handle, done) = BotHandle::new(index, pid);
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => BotExit::Exited {
                code: status.code(),
            },
            Err(err) => BotExit::Failed {
                error: err.to_string(),
            },
        };
        // Every output line is queued before the completion.
        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }
        let _ = done.send(exit);
    });
    Ok(handle)
}

async fn read_stream<R>(index: usize, stream: StreamKind, reader: R, tx: mpsc::Sender<Event>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = tx.send(Event::BotOutput { index, line, stream }).await;
    }
}

#[cfg(unix)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
pub fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the only console signal a process group can receive.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
pub fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AuthPolicy, Credential};

    fn request(index: usize) -> ConnectRequest {
        ConnectRequest {
            index,
            total: 4,
            client_kind: "autoplay".into(),
            query: Some("lang=en".into()),
            credential: Credential::Policy(AuthPolicy::CreateNew),
        }
    }

    #[test]
    fn renders_template_and_environment() {
        let command = BotCommand::render(
            "node bin/phantom.js --channel {channel} --n {index}/{total} --type {client} --q '{query}'",
            "ultimatum",
            PathBuf::from("/games/ultimatum"),
            &HashMap::from([("NODE_ENV".to_string(), "test".to_string())]),
            &request(2),
        )
        .unwrap();
        assert_eq!(command.cmd, "node");
        assert_eq!(
            command.args,
            vec![
                "bin/phantom.js",
                "--channel",
                "ultimatum",
                "--n",
                "2/4",
                "--type",
                "autoplay",
                "--q",
                "lang=en"
            ]
        );
        assert_eq!(command.env["BOTRACK_INDEX"], "2");
        assert_eq!(command.env["BOTRACK_AUTH"], "\"createNew\"");
        assert_eq!(command.env["NODE_ENV"], "test");
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = BotCommand::render("  ", "c", PathBuf::from("."), &HashMap::new(), &request(0))
            .unwrap_err();
        assert!(err.to_string().contains("empty bot command"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn completion_carries_exit_code_and_output_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let command = BotCommand::render(
            "sh -c 'echo hello from $BOTRACK_INDEX; exit 3'",
            "c",
            dir.path().to_path_buf(),
            &HashMap::new(),
            &request(1),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = spawn_bot(1, &command, tx).unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.finished().await, BotExit::Exited { code: Some(3) });

        match rx.recv().await {
            Some(Event::BotOutput { index, line, stream }) => {
                assert_eq!(index, 1);
                assert_eq!(line, "hello from 1");
                assert_eq!(stream, StreamKind::Stdout);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn all_output_is_queued_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let command = BotCommand::render(
            "sh -c 'i=0; while [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done; echo done >&2'",
            "c",
            dir.path().to_path_buf(),
            &HashMap::new(),
            &request(0),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(4096);
        let handle = spawn_bot(0, &command, tx).unwrap();
        assert_eq!(handle.finished().await, BotExit::Exited { code: Some(0) });

        let mut stdout = Vec::new();
        let mut stderr = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::BotOutput {
                    line,
                    stream: StreamKind::Stdout,
                    ..
                } => stdout.push(line),
                Event::BotOutput { .. } => stderr += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(stdout.len(), 2000);
        assert_eq!(stdout.last().map(String::as_str), Some("line1999"));
        assert_eq!(stderr, 1);
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let command = BotCommand::render(
            "definitely-not-a-real-bot-binary",
            "c",
            dir.path().to_path_buf(),
            &HashMap::new(),
            &request(0),
        )
        .unwrap();
        let (tx, _rx) = mpsc::channel(1);
        assert!(spawn_bot(0, &command, tx).is_err());
    }
}
