//! OpenSSH-backed sessions
//!
//! Each session is one ControlMaster connection: the master authenticates
//! once and every command is multiplexed over its control socket, so a run
//! keeps a single TCP connection with keepalive for its whole duration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authn::credentials::Credential;
use crate::filesys::dir::Dir;
use crate::models::website::ConnectionDescriptor;
use crate::session::runner::{run_to_completion, Completion};
use crate::session::{CommandOutput, Connector, OutputLine, Session, SessionError};
use crate::utils::tail_lines;

/// How long a control-socket management command may take
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness checks of a starting master
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// SSH client options
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// OpenSSH client binary
    pub ssh_binary: String,

    /// `sshpass` binary, used for password credentials
    pub sshpass_binary: String,

    /// Seconds between keepalive probes
    pub keepalive_interval: Duration,

    /// Unanswered keepalives before the connection is dropped
    pub keepalive_count_max: u32,

    /// `StrictHostKeyChecking` value (`accept-new`, `yes`, `no`)
    pub strict_host_key_checking: String,

    /// Known hosts file; a per-session file when absent
    pub known_hosts_file: Option<PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            keepalive_interval: Duration::from_secs(15),
            keepalive_count_max: 4,
            strict_host_key_checking: "accept-new".to_string(),
            known_hosts_file: None,
        }
    }
}

/// Opens OpenSSH ControlMaster sessions
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn common_args(&self, descriptor: &ConnectionDescriptor, work_dir: &Dir, timeout: Duration) -> Vec<String> {
        let known_hosts = self
            .options
            .known_hosts_file
            .clone()
            .unwrap_or_else(|| work_dir.path().join("known_hosts"));

        vec![
            "-p".to_string(),
            descriptor.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.options.keepalive_interval.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.options.keepalive_count_max),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.options.strict_host_key_checking),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", known_hosts.display()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError> {
        let work_dir = Dir::create_temp_dir("pressbuild-ssh")
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        let control_path = work_dir.path().join("ctl");
        let destination = format!("{}@{}", descriptor.username, descriptor.host);

        let mut args = self.common_args(descriptor, &work_dir, timeout);
        let mut program = self.options.ssh_binary.clone();
        let mut command_env: Option<(&str, String)> = None;
        let key_file = work_dir.file("id");

        // The credential is consumed here and dropped at the end of `open`.
        match &credential {
            Credential::PrivateKey(_) => {
                let mut key = credential.secret().to_string();
                if !key.ends_with('\n') {
                    key.push('\n');
                }
                let written = async {
                    key_file.write_string(&key).await?;
                    key_file.set_permissions_600().await
                }
                .await;
                if let Err(e) = written {
                    let _ = work_dir.delete().await;
                    return Err(SessionError::Io(std::io::Error::other(e.to_string())));
                }
                args.extend([
                    "-i".to_string(),
                    key_file.path().display().to_string(),
                    "-o".to_string(),
                    "IdentitiesOnly=yes".to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "PasswordAuthentication=no".to_string(),
                ]);
            }
            Credential::Password(_) => {
                args.extend([
                    "-o".to_string(),
                    "PreferredAuthentications=password,keyboard-interactive".to_string(),
                    "-o".to_string(),
                    "PubkeyAuthentication=no".to_string(),
                    "-o".to_string(),
                    "NumberOfPasswordPrompts=1".to_string(),
                ]);
                args.insert(0, self.options.ssh_binary.clone());
                args.insert(0, "-e".to_string());
                program = self.options.sshpass_binary.clone();
                command_env = Some(("SSHPASS", credential.secret().to_string()));
            }
        }

        let mut master = Command::new(&program);
        master
            .args(&args)
            .args(["-M", "-N", "-o", "ControlPersist=no", "-S"])
            .arg(&control_path)
            .arg(&destination)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some((key, value)) = command_env.take() {
            master.env(key, value);
        }
        drop(credential);

        debug!("Starting SSH control master");
        let mut child = match master.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = work_dir.delete().await;
                return Err(SessionError::Io(e));
            }
        };
        let stderr_task = spawn_stderr_reader(&mut child);

        let session = SshSession {
            ssh_binary: self.options.ssh_binary.clone(),
            destination,
            port: descriptor.port,
            control_path,
            work_dir,
            master: Mutex::new(Some(child)),
            stderr_task: std::sync::Mutex::new(Some(stderr_task)),
            closed: AtomicBool::new(false),
        };

        match session.wait_ready(timeout).await {
            Ok(()) => {
                // authenticated: the key is no longer needed on disk
                let _ = key_file.delete().await;
                info!("SSH session established");
                Ok(Box::new(session))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}

fn spawn_stderr_reader(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut captured = String::new();
        if let Some(mut stderr) = stderr {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            captured = String::from_utf8_lossy(&buf).to_string();
        }
        captured
    })
}

/// A session multiplexed over one OpenSSH control master
pub struct SshSession {
    ssh_binary: String,
    destination: String,
    port: u16,
    control_path: PathBuf,
    work_dir: Dir,
    master: Mutex<Option<Child>>,
    stderr_task: std::sync::Mutex<Option<JoinHandle<String>>>,
    closed: AtomicBool,
}

impl SshSession {
    fn control_command(&self) -> Command {
        let mut command = Command::new(&self.ssh_binary);
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no", "-o", "BatchMode=yes", "-o", "LogLevel=ERROR"])
            .args(["-p", &self.port.to_string()]);
        command
    }

    /// Poll the control socket until the master has authenticated, it
    /// exits, or `timeout` passes
    async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(exit_code) = self.master_exit_code().await {
                let stderr = self.take_master_stderr().await;
                return Err(classify_connect_failure(&stderr, Some(exit_code)));
            }

            let mut check = self.control_command();
            check.args(["-O", "check"]).arg(&self.destination);
            if let Ok(Completion::Exited(output)) =
                run_to_completion(check, CONTROL_TIMEOUT, None).await
            {
                if output.success() {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(SessionError::Timeout(format!(
                    "no SSH session after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Exit code of the master if it has stopped
    async fn master_exit_code(&self) -> Option<i32> {
        let mut master = self.master.lock().await;
        match master.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
                Ok(None) => None,
                Err(_) => Some(-1),
            },
            None => Some(-1),
        }
    }

    async fn take_master_stderr(&self) -> String {
        let task = {
            let mut guard = self.stderr_task.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        match task {
            Some(task) => tokio::time::timeout(CONTROL_TIMEOUT, task)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn execute_streaming(
        &self,
        command: &str,
        timeout: Duration,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<CommandOutput, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed("session already closed".to_string()));
        }
        if self.master_exit_code().await.is_some() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(SessionError::SessionClosed("control connection dropped".to_string()));
        }

        let mut remote = self.control_command();
        remote.arg("-T").arg(&self.destination).arg("--").arg(command);

        match run_to_completion(remote, timeout, lines).await? {
            Completion::TimedOut => Err(SessionError::CommandTimeout(timeout)),
            Completion::Exited(output) => {
                // 255 is ssh's own failure code; a remote command may use it too
                if output.exit_code == 255 && self.master_exit_code().await.is_some() {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(SessionError::SessionClosed(tail_lines(&output.stderr, 3)));
                }
                if output.exit_code == 255 && is_mux_failure(&output.stderr) {
                    return Err(SessionError::SessionClosed(tail_lines(&output.stderr, 3)));
                }
                Ok(output)
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut exit = self.control_command();
        exit.args(["-O", "exit"]).arg(&self.destination);
        let _ = run_to_completion(exit, CONTROL_TIMEOUT, None).await;

        if let Some(mut child) = self.master.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self
            .stderr_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Err(e) = self.work_dir.delete().await {
            warn!("Failed to remove SSH session directory: {}", e);
        }
        debug!("SSH session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // The master child is killed on drop; only the key/socket dir remains.
        if !self.closed.load(Ordering::SeqCst) {
            let _ = std::fs::remove_dir_all(self.work_dir.path());
        }
    }
}

fn is_mux_failure(stderr: &str) -> bool {
    stderr.contains("Control socket connect")
        || stderr.contains("mux_client")
        || stderr.contains("master is not running")
}

/// Map a failed connection attempt to a session error from the client's
/// stderr and exit code
pub fn classify_connect_failure(stderr: &str, exit_code: Option<i32>) -> SessionError {
    let detail = tail_lines(stderr, 3);
    let lower = stderr.to_lowercase();

    // sshpass: 5 = invalid password, 6 = host key unknown
    if exit_code == Some(5)
        || lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
    {
        return SessionError::AuthFailure(detail);
    }
    if lower.contains("connection refused") {
        return SessionError::ConnectionRefused(detail);
    }
    if lower.contains("timed out") {
        return SessionError::Timeout(detail);
    }
    if lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
        || lower.contains("host is down")
    {
        return SessionError::HostUnreachable(detail);
    }

    SessionError::HostUnreachable(if detail.is_empty() {
        format!("ssh exited with code {}", exit_code.unwrap_or(-1))
    } else {
        detail
    })
}
