//! Remote execution over SSH (libssh2).
//!
//! libssh2 is blocking, so every session lives on a `spawn_blocking` worker.
//! The session and its TCP stream are dropped when the worker returns,
//! whatever the outcome.

use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{ExtendedData, Session};
use tracing::{debug, warn};

use super::local::push_line;
use super::{CommandOutput, ExecutionTarget, OutputSink, RemoteTransport};
use crate::error::{Error, Result};

/// [`RemoteTransport`] backed by the `ssh2` crate.
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Wall-clock budget for one remote command.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    limit: Option<Duration>,
    started: Instant,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            started: Instant::now(),
        }
    }

    /// Timeout for the next blocking libssh2 call in milliseconds, 0 meaning
    /// none. `None` once the budget is spent.
    fn next_call_timeout(&self) -> Option<u32> {
        let Some(limit) = self.limit else {
            return Some(0);
        };
        let remaining = limit.checked_sub(self.started.elapsed())?;
        let ms = millis(remaining);
        (ms > 0).then_some(ms)
    }

    fn expired(&self) -> bool {
        self.next_call_timeout().is_none()
    }
}

impl SshTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Open an authenticated session. Every blocking call made here is
    /// bounded by the connect timeout.
    fn connect(&self, target: &ExecutionTarget) -> Result<Session> {
        let host = target.host;
        let credential = &target.credential;
        let addr = SocketAddr::new(host, credential.port(host)?);

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| Error::connection(host, format!("failed to connect {addr}: {e}")))?;
        let mut session = Session::new()
            .map_err(|e| Error::connection(host, format!("failed to create ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.connect_timeout).max(1));
        session
            .handshake()
            .map_err(|e| Error::connection(host, format!("ssh handshake failed: {e}")))?;

        let user = credential.user();
        if !credential.private_key_path.is_empty() {
            let passphrase = Some(credential.private_key_passphrase.as_str())
                .filter(|p| !p.is_empty());
            session
                .userauth_pubkey_file(user, None, Path::new(&credential.private_key_path), passphrase)
                .map_err(|e| Error::connection(host, format!("public key auth failed: {e}")))?;
        } else if !credential.password.is_empty() {
            session
                .userauth_password(user, &credential.password)
                .map_err(|e| Error::connection(host, format!("password auth failed: {e}")))?;
        } else {
            return Err(Error::InvalidCredential {
                host,
                reason: "neither password nor private key configured".to_string(),
            });
        }

        if !session.authenticated() {
            return Err(Error::connection(host, format!("authentication failed for user {user}")));
        }
        debug!(host = %host, user = %user, "SSH session established");
        Ok(session)
    }

    fn run_blocking(
        &self,
        target: &ExecutionTarget,
        command: &str,
        limit: Option<Duration>,
        sink: Option<&OutputSink>,
    ) -> Result<CommandOutput> {
        let host = target.host;
        let deadline = Deadline::new(limit);
        let timed_out = || Error::CommandTimeout {
            host,
            command: command.to_string(),
            after: limit.unwrap_or_default(),
        };

        let session = self.connect(target)?;
        let result = Self::exec(&session, target, command, &deadline, sink);
        let result = match result {
            Err(_) if deadline.expired() => {
                warn!(host = %host, command = %command, "Remote command deadline exceeded, closing session");
                Err(timed_out())
            }
            other => other,
        };

        // Bound the goodbye too; the remote end may be wedged.
        session.set_timeout(millis(self.connect_timeout).max(1));
        if let Err(e) = session.disconnect(None, "done", None) {
            debug!(host = %host, error = %e, "SSH disconnect failed");
        }
        result
    }

    fn exec(
        session: &Session,
        target: &ExecutionTarget,
        command: &str,
        deadline: &Deadline,
        sink: Option<&OutputSink>,
    ) -> Result<CommandOutput> {
        let host = target.host;
        let channel_err = |e: ssh2::Error| Error::connection(host, format!("ssh channel error: {e}"));
        let arm = || -> Result<()> {
            let ms = deadline
                .next_call_timeout()
                .ok_or_else(|| Error::connection(host, "deadline exceeded"))?;
            session.set_timeout(ms);
            Ok(())
        };

        arm()?;
        let mut channel = session.channel_session().map_err(channel_err)?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(channel_err)?;
        for (key, value) in &target.env {
            // sshd drops variables not listed in AcceptEnv.
            if let Err(e) = channel.setenv(key, value) {
                debug!(host = %host, key = %key, error = %e, "Remote setenv refused");
            }
        }
        channel.exec(command).map_err(channel_err)?;

        let mut output = String::new();
        {
            let mut reader = BufReader::new(&mut channel);
            let mut buf = Vec::new();
            loop {
                arm()?;
                buf.clear();
                let read = reader
                    .read_until(b'\n', &mut buf)
                    .map_err(|e| Error::connection(host, format!("failed to read output: {e}")))?;
                if read == 0 {
                    break;
                }
                push_line(&mut output, host, &buf, sink);
            }
        }

        arm()?;
        channel.wait_close().map_err(channel_err)?;
        let status = channel.exit_status().map_err(channel_err)?;
        Ok(CommandOutput { status, output })
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run(
        &self,
        target: &ExecutionTarget,
        command: &str,
        deadline: Option<Duration>,
        sink: Option<OutputSink>,
    ) -> Result<CommandOutput> {
        let transport = self.clone();
        let target = target.clone();
        let command = command.to_string();
        let host = target.host;

        tokio::task::spawn_blocking(move || {
            transport.run_blocking(&target, &command, deadline, sink.as_ref())
        })
        .await
        .map_err(|e| Error::connection(host, format!("ssh worker failed: {e}")))?
    }

    async fn ping(&self, target: &ExecutionTarget) -> Result<()> {
        let transport = self.clone();
        let target = target.clone();
        let host = target.host;

        tokio::task::spawn_blocking(move || {
            let session = transport.connect(&target)?;
            session
                .disconnect(None, "ping", None)
                .map_err(|e| Error::connection(host, format!("failed to close ssh session: {e}")))
        })
        .await
        .map_err(|e| Error::connection(host, format!("ssh worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostCredential;
    use std::net::TcpListener;

    fn target(port: u16, credential: HostCredential) -> ExecutionTarget {
        ExecutionTarget {
            host: "127.0.0.1".parse().unwrap(),
            credential: HostCredential {
                port: port.to_string(),
                ..credential
            },
            env: vec![],
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport = SshTransport::new(Duration::from_secs(2));

        let err = transport
            .ping(&target(port, HostCredential::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_invalid_port_is_credential_error() {
        let transport = SshTransport::new(Duration::from_secs(2));
        let mut bad = target(22, HostCredential::default());
        bad.credential.port = "not-a-port".to_string();

        let err = transport.run(&bad, "true", None, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredential { .. }));
    }

    #[tokio::test]
    async fn test_silent_server_handshake_is_bounded() {
        // Accepts TCP connections (via the backlog) but never speaks SSH.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = SshTransport::new(Duration::from_millis(500));
        let credential = HostCredential {
            password: "x".to_string(),
            ..Default::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(20),
            transport.ping(&target(port, credential)),
        )
        .await
        .expect("handshake was not bounded");
        assert!(matches!(result, Err(Error::Connection { .. })), "got {result:?}");
        drop(listener);
    }

    #[test]
    fn test_deadline_budget() {
        let unlimited = Deadline::new(None);
        assert_eq!(unlimited.next_call_timeout(), Some(0));
        assert!(!unlimited.expired());

        let spent = Deadline::new(Some(Duration::ZERO));
        assert_eq!(spent.next_call_timeout(), None);
        assert!(spent.expired());

        let running = Deadline::new(Some(Duration::from_secs(60)));
        let millis = running.next_call_timeout().unwrap();
        assert!(millis > 0 && millis <= 60_000);
    }
}
