use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use hostmaster_core::{HostId, InvalidationSet, PartySet, TableId};

use crate::auth::Principal;
use crate::config::MasterConfig;
use crate::error::{io_err, MasterError, ProtocolError, RejectKind, ServiceError};
use crate::handler::RequestContext;
use crate::paths::LOG_ENV;
use crate::protocol::{
    read_frame, write_frame, ClientFrame, Hello, InvalidateFrame, Request, Response, ServerFrame,
    PROTOCOL_V2,
};
use crate::services::Services;
use crate::session::{SessionHandle, SessionPhase};

/// Load services from `config`, start the runtime and block the current
/// thread until ctrl-c.
pub fn start_blocking(config: MasterConfig) -> Result<(), MasterError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let result = runtime.block_on(run(Services::from_config(config)));
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

/// Accept connections on the configured address until ctrl-c.
pub async fn run(services: Arc<Services>) -> Result<(), MasterError> {
    let addr = services.config.listen;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| io_err(format!("bind {addr}"), e))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let server_handle = {
        let shutdown = shutdown_tx.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result = serve(listener, services, shutdown.clone()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down master");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(MasterError::Task(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (server_result, signal_result) = tokio::join!(server_handle, signal_handle);
    handle_join("server", server_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Accept loop. Returns once `shutdown` fires; open sessions are closed.
pub async fn serve(
    listener: TcpListener,
    services: Arc<Services>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), MasterError> {
    let mut shutdown_rx = shutdown.subscribe();
    let local = listener
        .local_addr()
        .map_err(|e| io_err("listener address", e))?;
    tracing::info!(
        addr = %local,
        protocol_min = services.config.protocol.min,
        protocol_max = services.config.protocol.max,
        "master listening",
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let services = services.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(handle_connection(stream, peer, services, shutdown_rx));
            }
        }
    }

    tracing::info!(sessions = services.registry.len(), "master stopped accepting connections");
    Ok(())
}

/// A master running on its own thread and runtime. Dropping the handle
/// stops it.
pub struct MasterHandle {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    thread: Option<thread::JoinHandle<Result<(), MasterError>>>,
}

impl MasterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) -> Result<(), MasterError> {
        let _ = self.shutdown.send(());
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| MasterError::Task("master thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Bind the configured address and serve on a background thread.
pub fn spawn(services: Arc<Services>) -> Result<MasterHandle, MasterError> {
    let bind = services.config.listen;
    let listener =
        std::net::TcpListener::bind(bind).map_err(|e| io_err(format!("bind {bind}"), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| io_err("configure listener", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| io_err("listener address", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    let (shutdown, _) = broadcast::channel::<()>(16);
    let shutdown_for_thread = shutdown.clone();
    let thread = thread::Builder::new()
        .name("hostmaster".to_string())
        .spawn(move || {
            let result = runtime.block_on(async move {
                let listener = TcpListener::from_std(listener)
                    .map_err(|e| io_err("register listener", e))?;
                serve(listener, services, shutdown_for_thread).await
            });
            runtime.shutdown_timeout(Duration::from_secs(1));
            result
        })
        .map_err(|e| io_err("spawn master thread", e))?;

    Ok(MasterHandle {
        addr,
        shutdown,
        thread: Some(thread),
    })
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: Arc<Services>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let session = services.registry.register(peer.to_string());
    transition(&session, SessionPhase::Connected);

    let result = tokio::select! {
        result = serve_session(stream, &session, &services) => result,
        _ = shutdown_rx.recv() => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(connection_id = %session.id(), %peer, error = %err, "session ended with error");
    }

    services.registry.close(&session);
    transition(&session, SessionPhase::Closed);
}

fn transition(session: &SessionHandle, phase: SessionPhase) {
    tracing::debug!(
        connection_id = %session.id(),
        peer = session.peer(),
        ?phase,
        "session phase",
    );
}

async fn serve_session(
    stream: TcpStream,
    session: &Arc<SessionHandle>,
    services: &Arc<Services>,
) -> Result<(), MasterError> {
    let (mut reader, mut writer) = stream.into_split();

    transition(session, SessionPhase::Handshaking);
    if !handshake(&mut reader, &mut writer, session, services).await? {
        return Ok(());
    }
    transition(session, SessionPhase::Serving);

    loop {
        let frame = match read_frame::<_, ClientFrame>(&mut reader).await {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(err @ (ProtocolError::Malformed(_) | ProtocolError::FrameTooLarge { .. })) => {
                let error = ServiceError::new("protocol_error", err.to_string());
                write_frame(&mut writer, &ServerFrame::Response(Response::error(0, error)))
                    .await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let request = match frame {
            ClientFrame::Request(request) => request,
            ClientFrame::Hello(_) => {
                let err = ProtocolError::UnexpectedFrame {
                    expected: "request",
                    got: "hello".to_string(),
                };
                let error = ServiceError::new("protocol_error", err.to_string());
                write_frame(&mut writer, &ServerFrame::Response(Response::error(0, error)))
                    .await?;
                return Err(err.into());
            }
        };

        let response = dispatch(services, session, request).await;
        write_frame(&mut writer, &ServerFrame::Response(response)).await?;
        flush_invalidations(&mut writer, session, services).await?;
    }
}

/// Returns `false` when the peer was rejected or left before saying hello.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    session: &SessionHandle,
    services: &Services,
) -> Result<bool, MasterError> {
    let timeout = services.config.handshake_timeout();
    let frame = match tokio::time::timeout(timeout, read_frame::<_, ClientFrame>(reader)).await {
        Err(_) => {
            tracing::warn!(connection_id = %session.id(), timeout_ms = timeout.as_millis() as u64, "handshake timed out");
            return Ok(false);
        }
        Ok(Err(ProtocolError::ConnectionClosed)) => return Ok(false),
        Ok(Err(err)) => {
            reject(writer, services, RejectKind::Malformed, err.to_string()).await?;
            return Ok(false);
        }
        Ok(Ok(frame)) => frame,
    };

    let hello = match frame {
        ClientFrame::Hello(hello) => hello,
        ClientFrame::Request(_) => {
            reject(writer, services, RejectKind::Malformed, "expected hello".to_string()).await?;
            return Ok(false);
        }
    };

    let principal = match check_hello(services, &hello) {
        Ok(principal) => principal,
        Err((kind, message)) => {
            tracing::warn!(
                connection_id = %session.id(),
                username = %hello.username,
                %kind,
                %message,
                "handshake rejected",
            );
            reject(writer, services, kind, message).await?;
            return Ok(false);
        }
    };

    session.establish(hello.protocol_version, principal, hello.daemon_host.clone());
    tracing::info!(
        connection_id = %session.id(),
        username = %hello.username,
        protocol_version = hello.protocol_version,
        daemon_host = ?hello.daemon_host,
        "session established",
    );
    write_frame(
        writer,
        &ServerFrame::Welcome {
            connection_id: session.id().0,
            protocol_version: hello.protocol_version,
        },
    )
    .await?;
    Ok(true)
}

/// Version, then credentials, then daemon binding.
fn check_hello(services: &Services, hello: &Hello) -> Result<Principal, (RejectKind, String)> {
    let supported = services.config.protocol;
    if !supported.contains(hello.protocol_version) {
        let err = ProtocolError::UnsupportedVersion {
            requested: hello.protocol_version,
            min: supported.min,
            max: supported.max,
        };
        return Err((RejectKind::UnsupportedVersion, err.to_string()));
    }

    let principal = services
        .authenticator
        .authenticate(&hello.username, &hello.secret)
        .ok_or_else(|| (RejectKind::AuthFailed, "invalid username or secret".to_string()))?;

    if let Some(host) = &hello.daemon_host {
        if !principal.can_bind(host) {
            return Err((
                RejectKind::BindingDenied,
                format!("{} may not bind a daemon session to {host}", principal.username),
            ));
        }
    }
    Ok(principal)
}

async fn reject(
    writer: &mut OwnedWriteHalf,
    services: &Services,
    kind: RejectKind,
    message: String,
) -> Result<(), MasterError> {
    let frame = ServerFrame::Rejected {
        kind,
        message,
        supported: services.config.protocol,
    };
    write_frame(writer, &frame).await?;
    Ok(())
}

/// Write every queued batch, oldest first, releasing each barrier token
/// once its frame is on the wire.
async fn flush_invalidations(
    writer: &mut OwnedWriteHalf,
    session: &SessionHandle,
    services: &Services,
) -> Result<(), MasterError> {
    let with_sequence = session.protocol_version().unwrap_or(0) >= PROTOCOL_V2;
    for batch in session.drain() {
        let sequence = batch
            .token
            .as_ref()
            .filter(|_| with_sequence)
            .map(|token| token.sequence);
        let frame = ServerFrame::Invalidate(InvalidateFrame {
            tables: batch.tables,
            sequence,
        });
        write_frame(writer, &frame).await?;
        if let Some(token) = &batch.token {
            services.barrier.release(token);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn dispatch(services: &Arc<Services>, session: &Arc<SessionHandle>, request: Request) -> Response {
    let id = request.id;
    let result = match request.cmd.as_str() {
        "ping" => Ok(json!({ "pong": true, "connection_id": session.id() })),
        "listen_caches" => {
            let keepalive = services.config.listen_caches_keepalive();
            let pending = session.wait_for_work(keepalive).await;
            Ok(json!({ "pending": pending }))
        }
        "invalidate" => require_master(session).and_then(|()| invalidate(services, &request.args)),
        "wait_for_invalidates" => match require_master(session) {
            Ok(()) => wait_for_invalidates(services, session, &request.args).await,
            Err(err) => Err(err),
        },
        "daemon_status" => require_master(session).and_then(|()| {
            let args: HostArgs = parse_args(&request.args)?;
            to_data(&services.pool.status(&args.host))
        }),
        "status" => require_master(session).map(|()| status(services)),
        _ => run_handler(services, session, request).await,
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => {
            tracing::debug!(connection_id = %session.id(), request_id = id, error = %err, "request failed");
            Response::error(id, err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvalidateArgs {
    table: String,
    #[serde(default)]
    host: Option<HostId>,
}

#[derive(Debug, Deserialize)]
struct HostArgs {
    host: HostId,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ServiceError> {
    serde_json::from_value(args.clone())
        .map_err(|e| ServiceError::invalid_argument(format!("invalid arguments: {e}")))
}

fn to_data<T: serde::Serialize>(value: &T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::new("internal", e.to_string()))
}

fn require_master(session: &SessionHandle) -> Result<(), ServiceError> {
    match session.principal() {
        Some(principal) if principal.master => Ok(()),
        _ => Err(ServiceError::forbidden("master privilege required")),
    }
}

/// Operator-issued invalidation: every account, optionally one host, with
/// cascade.
fn invalidate(services: &Services, args: &Value) -> Result<Value, ServiceError> {
    let args: InvalidateArgs = parse_args(args)?;
    let table: TableId = args
        .table
        .parse()
        .map_err(|e: hostmaster_core::CoreError| ServiceError::invalid_argument(e.to_string()))?;

    let mut set = InvalidationSet::new();
    match args.host {
        Some(host) => {
            let hosts: PartySet<HostId> = [host].into_iter().collect();
            set.add_table(table, &PartySet::All, &hosts, true);
        }
        None => set.add_all(table, true),
    }
    let summary = services.publish(set);
    to_data(&summary)
}

/// Block until `host`'s daemons have received every batch queued for them.
/// A session bound to that host cannot wait on itself: its own batches only
/// go out once this call has returned.
async fn wait_for_invalidates(
    services: &Arc<Services>,
    session: &SessionHandle,
    args: &Value,
) -> Result<Value, ServiceError> {
    let args: HostArgs = parse_args(args)?;
    if session.daemon_host() == Some(&args.host) {
        return Err(ServiceError::invalid_argument(format!(
            "session is bound to {} and would wait on its own batches",
            args.host
        )));
    }
    let barrier = services.barrier.clone();
    let host = args.host;
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = barrier.wait_for_invalidates(&host);
        (host, outcome)
    })
    .await
    .map_err(|e| ServiceError::new("internal", format!("barrier wait failed: {e}")))?;
    Ok(json!({ "host": outcome.0, "outcome": outcome.1 }))
}

fn status(services: &Services) -> Value {
    json!({
        "sessions": services.registry.snapshot(),
        "pending_tokens": services.barrier.pending_count(),
        "down_hosts": services.pool.down_hosts(),
        "cached_connectors": services.pool.cached_connectors(),
        "protocol": services.config.protocol,
    })
}

/// Run a business command on the blocking pool. Its invalidations are
/// published only if it succeeds.
async fn run_handler(
    services: &Arc<Services>,
    session: &Arc<SessionHandle>,
    request: Request,
) -> Result<Value, ServiceError> {
    let services = services.clone();
    let session = session.clone();
    tokio::task::spawn_blocking(move || {
        let principal = session
            .principal()
            .ok_or_else(|| ServiceError::forbidden("session not established"))?;
        let ctx = RequestContext {
            connection_id: session.id(),
            protocol_version: session.protocol_version().unwrap_or_default(),
            principal,
            daemon_host: session.daemon_host(),
            pool: &services.pool,
            barrier: &services.barrier,
        };
        match services.handler.handle(&ctx, &request) {
            Ok(reply) => {
                services.publish(reply.invalidations);
                Ok(reply.data)
            }
            Err(err) => {
                tracing::debug!(
                    connection_id = %session.id(),
                    cmd = %request.cmd,
                    kind = %err.kind,
                    "handler failed; discarding invalidations",
                );
                Err(err)
            }
        }
    })
    .await
    .map_err(|e| ServiceError::new("internal", format!("handler task failed: {e}")))?
}

/// A master task either returned its own error or stopped without
/// returning at all (panic or cancellation).
fn handle_join(
    task: &'static str,
    joined: Result<Result<(), MasterError>, tokio::task::JoinError>,
) -> Result<(), MasterError> {
    joined.map_err(|source| MasterError::TaskStopped { task, source })?
}

/// Install the fmt subscriber. `HOSTMASTER_LOG` takes precedence over
/// `RUST_LOG`; with neither set the level is `info`.
pub fn init_tracing() {
    use tracing_subscriber::fmt;

    let _ = fmt().with_env_filter(log_filter()).with_target(false).try_init();
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::config::UserConfig;

    fn services() -> Arc<Services> {
        let mut config = MasterConfig::default();
        config.users = vec![
            UserConfig {
                username: "admin".to_string(),
                secret: "s".to_string(),
                master: true,
                daemon_hosts: BTreeSet::new(),
            },
            UserConfig {
                username: "daemon-web1".to_string(),
                secret: "k".to_string(),
                master: false,
                daemon_hosts: [HostId::from("web1")].into_iter().collect(),
            },
        ];
        Services::from_config(config)
    }

    fn hello(version: u16, user: &str, secret: &str, host: Option<&str>) -> Hello {
        Hello {
            protocol_version: version,
            username: user.to_string(),
            secret: secret.to_string(),
            daemon_host: host.map(HostId::from),
        }
    }

    #[test]
    fn hello_checks_version_before_credentials() {
        let services = services();
        let (kind, message) = check_hello(&services, &hello(9, "nobody", "x", None)).unwrap_err();
        assert_eq!(kind, RejectKind::UnsupportedVersion);
        assert!(message.contains("1..=2"), "got: {message}");
    }

    #[test]
    fn hello_rejects_bad_credentials_and_foreign_bindings() {
        let services = services();
        assert_eq!(
            check_hello(&services, &hello(2, "admin", "wrong", None)).unwrap_err().0,
            RejectKind::AuthFailed
        );
        assert_eq!(
            check_hello(&services, &hello(2, "daemon-web1", "k", Some("web2")))
                .unwrap_err()
                .0,
            RejectKind::BindingDenied
        );
        assert_eq!(
            check_hello(&services, &hello(2, "admin", "s", Some("web1")))
                .unwrap_err()
                .0,
            RejectKind::BindingDenied,
            "master privilege alone does not grant a binding"
        );
        let principal =
            check_hello(&services, &hello(1, "daemon-web1", "k", Some("web1"))).expect("ok");
        assert_eq!(principal.username, "daemon-web1");
    }

    #[test]
    fn invalidate_command_cascades_for_all_accounts() {
        let services = services();
        let summary = invalidate(&services, &json!({ "table": "accounts" })).expect("publish");
        let tables: Vec<String> =
            serde_json::from_value(summary["tables"].clone()).expect("tables");
        assert!(tables.contains(&"accounts".to_string()));
        assert!(tables.contains(&"profiles".to_string()));
    }

    #[test]
    fn invalidate_command_rejects_unknown_tables() {
        let services = services();
        let err = invalidate(&services, &json!({ "table": "nope" })).unwrap_err();
        assert_eq!(err.kind, "invalid_argument");
    }

    #[tokio::test]
    async fn bound_session_cannot_wait_on_its_own_host() {
        let services = services();
        let session = SessionHandle::new(crate::session::ConnectionId(7), "ops");
        session.establish(
            2,
            Principal {
                username: "ops".to_string(),
                master: true,
                daemon_hosts: [HostId::from("web1")].into_iter().collect(),
            },
            Some(HostId::from("web1")),
        );
        let err = wait_for_invalidates(&services, &session, &json!({ "host": "web1" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_argument");

        let outcome = wait_for_invalidates(&services, &session, &json!({ "host": "web2" }))
            .await
            .expect("other hosts are fine");
        assert_eq!(outcome["outcome"], "clear");
    }

    #[tokio::test]
    async fn panicked_task_is_reported_by_name() {
        let joined = tokio::spawn(async {
            if true {
                panic!("boom");
            }
            Ok::<(), MasterError>(())
        })
        .await;
        let err = handle_join("server", joined).unwrap_err();
        assert!(
            matches!(err, MasterError::TaskStopped { task: "server", .. }),
            "got: {err}"
        );

        let inner = handle_join("signal_handler", Ok(Err(MasterError::Task("no signal".into()))));
        assert!(matches!(inner, Err(MasterError::Task(_))));
        assert!(handle_join("server", Ok(Ok(()))).is_ok());
    }

    #[test]
    fn privileged_commands_need_master() {
        let session = SessionHandle::new(crate::session::ConnectionId(1), "test");
        assert_eq!(require_master(&session).unwrap_err().kind, "forbidden");
    }
}
