use std::collections::BTreeSet;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use hostmaster_core::{HostId, InvalidationSet, TableId};
use hostmaster_server::config::UserConfig;
use hostmaster_server::protocol::{
    read_frame_blocking, write_frame_blocking, ClientFrame, ServerFrame,
};
use hostmaster_server::{
    spawn, HandlerReply, Hello, MasterClient, MasterConfig, MasterError, MasterHandle,
    RejectKind, Request, RequestContext, RequestHandler, ServiceError, Services,
};

/// Records a `net_binds` change for `args.host`; `failing_update` records
/// the same change and then fails.
struct BindsHandler;

impl RequestHandler for BindsHandler {
    fn handle(
        &self,
        ctx: &RequestContext<'_>,
        request: &Request,
    ) -> Result<HandlerReply, ServiceError> {
        let host = request
            .args
            .get("host")
            .and_then(Value::as_str)
            .map(HostId::from)
            .ok_or_else(|| ServiceError::invalid_argument("host required"))?;
        let mut set = InvalidationSet::new();
        set.add_hosts(TableId::NetBinds, [host], true);

        match request.cmd.as_str() {
            "update_binds" => Ok(HandlerReply::new(json!({
                "updated": true,
                "by": ctx.principal.username,
            }))
            .with_invalidations(set)),
            "failing_update" => Err(ServiceError::new("conflict", "simulated failure")),
            other => Err(ServiceError::unknown_command(other)),
        }
    }
}

fn user(name: &str, master: bool, hosts: &[&str]) -> UserConfig {
    UserConfig {
        username: name.to_string(),
        secret: format!("{name}-secret"),
        master,
        daemon_hosts: hosts.iter().map(|h| HostId::from(*h)).collect::<BTreeSet<_>>(),
    }
}

fn start_master(ceiling: Duration) -> MasterHandle {
    let mut config = MasterConfig::default();
    config.listen = "127.0.0.1:0".parse().expect("addr");
    config.listen_caches_keepalive_ms = 200;
    config.barrier.ceiling_ms = ceiling.as_millis() as u64;
    config.users = vec![
        user("admin", true, &[]),
        user("alice", false, &[]),
        user("daemon-web1", false, &["web1"]),
        user("daemon-web2", false, &["web2"]),
        user("ops-web1", true, &["web1"]),
    ];
    let services = Services::builder(config)
        .handler(Arc::new(BindsHandler))
        .build();
    spawn(services).expect("spawn master")
}

fn hello(version: u16, name: &str, daemon_host: Option<&str>) -> Hello {
    Hello {
        protocol_version: version,
        username: name.to_string(),
        secret: format!("{name}-secret"),
        daemon_host: daemon_host.map(HostId::from),
    }
}

fn connect(master: &MasterHandle, version: u16, name: &str, host: Option<&str>) -> MasterClient {
    let client =
        MasterClient::connect(master.local_addr(), hello(version, name, host)).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(20)))
        .expect("timeout");
    client
}

fn tables_of(frames: &[hostmaster_server::InvalidateFrame]) -> BTreeSet<TableId> {
    frames.iter().flat_map(|f| f.tables.iter().copied()).collect()
}

#[test]
fn handshake_rejections_name_their_reason() {
    let master = start_master(Duration::from_secs(5));

    let err = MasterClient::connect(master.local_addr(), hello(9, "admin", None)).unwrap_err();
    assert!(
        matches!(err, MasterError::Rejected { kind: RejectKind::UnsupportedVersion, ref message } if message.contains("1..=2")),
        "got: {err}"
    );

    let mut bad = hello(2, "admin", None);
    bad.secret = "wrong".to_string();
    let err = MasterClient::connect(master.local_addr(), bad).unwrap_err();
    assert!(
        matches!(err, MasterError::Rejected { kind: RejectKind::AuthFailed, .. }),
        "got: {err}"
    );

    let err = MasterClient::connect(master.local_addr(), hello(2, "daemon-web1", Some("web2")))
        .unwrap_err();
    assert!(
        matches!(err, MasterError::Rejected { kind: RejectKind::BindingDenied, .. }),
        "got: {err}"
    );

    let client = connect(&master, 1, "alice", None);
    assert_eq!(client.protocol_version(), 1);
}

#[test]
fn committed_change_reaches_caller_and_other_sessions() {
    let master = start_master(Duration::from_secs(5));
    let mut x = connect(&master, 2, "alice", None);
    let mut y = connect(&master, 1, "admin", None);

    let data = x
        .call("update_binds", json!({ "host": "web1" }))
        .expect("update");
    assert_eq!(data["by"], "alice");

    // The caller's batch follows its response, ahead of the next response.
    x.call("ping", Value::Null).expect("ping");
    let seen_by_x = x.take_invalidations();
    assert!(tables_of(&seen_by_x).contains(&TableId::NetBinds));
    assert!(tables_of(&seen_by_x).contains(&TableId::HttpdSiteBinds));

    let seen_by_y = y.listen().expect("listen");
    assert!(tables_of(&seen_by_y).contains(&TableId::NetBinds));
    assert!(
        seen_by_y.iter().all(|f| f.sequence.is_none()),
        "unbound sessions carry no sequence"
    );
}

#[test]
fn failed_handler_publishes_nothing() {
    let master = start_master(Duration::from_secs(5));
    let mut x = connect(&master, 2, "alice", None);
    let mut y = connect(&master, 2, "admin", None);

    let err = x
        .call("failing_update", json!({ "host": "web1" }))
        .unwrap_err();
    assert!(
        matches!(err, MasterError::Service { ref kind, .. } if kind == "conflict"),
        "got: {err}"
    );

    x.call("ping", Value::Null).expect("connection stays open");
    assert!(x.take_invalidations().is_empty());
    assert!(y.listen().expect("listen").is_empty());
}

#[test]
fn unknown_command_is_a_typed_error() {
    let master = start_master(Duration::from_secs(5));
    let mut x = connect(&master, 2, "alice", None);
    let err = x.call("no_such_thing", json!({ "host": "web1" })).unwrap_err();
    assert!(
        matches!(err, MasterError::Service { ref kind, .. } if kind == "unknown_command"),
        "got: {err}"
    );
    x.call("ping", Value::Null).expect("still open");
}

#[test]
fn privileged_builtins_require_master() {
    let master = start_master(Duration::from_secs(5));
    let mut alice = connect(&master, 2, "alice", None);
    let err = alice
        .call("invalidate", json!({ "table": "dns_zones" }))
        .unwrap_err();
    assert!(
        matches!(err, MasterError::Service { ref kind, .. } if kind == "forbidden"),
        "got: {err}"
    );

    let mut admin = connect(&master, 2, "admin", None);
    let status = admin.call("status", Value::Null).expect("status");
    assert_eq!(status["sessions"].as_array().map(Vec::len), Some(2));
}

#[test]
fn daemon_receives_sequenced_batches_and_barrier_clears() {
    let master = start_master(Duration::from_secs(30));
    let mut daemon = connect(&master, 2, "daemon-web1", Some("web1"));
    let mut admin = connect(&master, 2, "admin", None);

    let summary = admin
        .call("invalidate", json!({ "table": "net_binds", "host": "web1" }))
        .expect("invalidate");
    assert_eq!(summary["tokens"][0]["sequence"], 1);

    let frames = daemon.listen().expect("listen");
    assert_eq!(frames[0].sequence, Some(1));

    let started = Instant::now();
    let outcome = admin
        .call("wait_for_invalidates", json!({ "host": "web1" }))
        .expect("wait");
    assert_eq!(outcome["outcome"], "clear");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn only_the_silent_host_holds_up_its_waiter() {
    let ceiling = Duration::from_millis(400);
    let master = start_master(ceiling);
    let mut web1 = connect(&master, 2, "daemon-web1", Some("web1"));
    let _web2 = connect(&master, 2, "daemon-web2", Some("web2"));
    let mut admin = connect(&master, 2, "admin", None);

    let summary = admin
        .call("invalidate", json!({ "table": "net_binds" }))
        .expect("invalidate");
    assert_eq!(summary["tokens"].as_array().map(Vec::len), Some(2));
    assert!(!web1.listen().expect("listen").is_empty());

    let started = Instant::now();
    let outcome = admin
        .call("wait_for_invalidates", json!({ "host": "web1" }))
        .expect("wait web1");
    assert_eq!(outcome["outcome"], "clear");
    assert!(started.elapsed() < ceiling);

    let started = Instant::now();
    let outcome = admin
        .call("wait_for_invalidates", json!({ "host": "web2" }))
        .expect("wait web2");
    assert_eq!(outcome["outcome"], "timed_out");
    assert!(started.elapsed() >= ceiling);
}

#[test]
fn closing_daemon_releases_a_blocked_waiter() {
    let master = start_master(Duration::from_secs(30));
    let daemon = connect(&master, 2, "daemon-web1", Some("web1"));
    let mut admin = connect(&master, 2, "admin", None);

    admin
        .call("invalidate", json!({ "table": "net_binds", "host": "web1" }))
        .expect("invalidate");

    let waiter = thread::spawn(move || {
        let started = Instant::now();
        let outcome = admin.call("wait_for_invalidates", json!({ "host": "web1" }));
        (outcome, started.elapsed())
    });
    thread::sleep(Duration::from_millis(200));
    drop(daemon);

    let (outcome, waited) = waiter.join().expect("join");
    assert_eq!(outcome.expect("wait")["outcome"], "clear");
    assert!(waited < Duration::from_secs(10), "waited {waited:?}");
}

#[test]
fn silent_daemon_times_out_and_caller_proceeds() {
    let ceiling = Duration::from_millis(300);
    let master = start_master(ceiling);
    let _daemon = connect(&master, 2, "daemon-web1", Some("web1"));
    let mut admin = connect(&master, 2, "admin", None);

    admin
        .call("invalidate", json!({ "table": "ip_addresses" }))
        .expect("invalidate");
    let started = Instant::now();
    let outcome = admin
        .call("wait_for_invalidates", json!({ "host": "web1" }))
        .expect("wait");
    let waited = started.elapsed();

    assert_eq!(outcome["outcome"], "timed_out");
    assert!(waited >= ceiling, "returned after {waited:?}");
    admin.call("ping", Value::Null).expect("caller keeps working");
}

#[test]
fn bound_master_cannot_wait_on_its_own_host() {
    let master = start_master(Duration::from_secs(30));
    let mut ops = connect(&master, 2, "ops-web1", Some("web1"));

    ops.call("invalidate", json!({ "table": "net_binds", "host": "web1" }))
        .expect("invalidate");
    let started = Instant::now();
    let err = ops
        .call("wait_for_invalidates", json!({ "host": "web1" }))
        .unwrap_err();
    assert!(
        matches!(err, MasterError::Service { ref kind, .. } if kind == "invalid_argument"),
        "got: {err}"
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    // Its own batch still goes out and the barrier clears.
    ops.call("ping", Value::Null).expect("ping");
    assert!(!ops.take_invalidations().is_empty());
    let mut admin = connect(&master, 2, "admin", None);
    let outcome = admin
        .call("wait_for_invalidates", json!({ "host": "web1" }))
        .expect("wait");
    assert_eq!(outcome["outcome"], "clear");
}

#[test]
fn malformed_request_gets_error_then_close() {
    let master = start_master(Duration::from_secs(5));
    let mut stream = TcpStream::connect(master.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("timeout");
    write_frame_blocking(&mut stream, &ClientFrame::Hello(hello(2, "alice", None)))
        .expect("hello");
    let welcome: ServerFrame = read_frame_blocking(&mut stream).expect("welcome");
    assert!(matches!(welcome, ServerFrame::Welcome { .. }));

    std::io::Write::write_all(&mut stream, &5u32.to_be_bytes()).expect("len");
    std::io::Write::write_all(&mut stream, b"nope!").expect("payload");

    let reply: ServerFrame = read_frame_blocking(&mut stream).expect("error response");
    match reply {
        ServerFrame::Response(response) => {
            assert!(!response.ok);
            assert_eq!(response.error.expect("error").kind, "protocol_error");
        }
        other => panic!("expected response, got {other:?}"),
    }
    assert!(read_frame_blocking::<_, ServerFrame>(&mut stream).is_err());
}

#[test]
fn shutdown_stops_the_master() {
    let master = start_master(Duration::from_secs(5));
    let addr = master.local_addr();
    let _client = connect(&master, 2, "alice", None);
    master.shutdown().expect("shutdown");
    assert!(MasterClient::connect(addr, hello(2, "alice", None)).is_err());
}
