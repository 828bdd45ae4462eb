//! Client/server sessions over a socketpair, no namespaces involved: the
//! server thread serves the real dispatch loop against the host, which
//! exercises the whole protocol stack without privileges.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::thread;

use ns0::client::{Client, RemoteSpawn};
use ns0::server::Server;
use ns0::{Error, ExitStatus, RemoteErrorKind};
use ns0_spawn::decode_status;

/// The kernel-facing handlers shell out to iproute2/bridge-utils; skip
/// those tests where the tools are missing.
fn kernel_tools() -> bool {
    if ns0_iproute::tools().is_err() {
        eprintln!("skipping: iproute2/bridge-utils not available");
        return false;
    }
    true
}

fn session() -> Client {
    let (master, slave) = UnixStream::pair().unwrap();
    thread::spawn(move || {
        let _ = Server::new(slave).unwrap().run();
    });
    Client::new(master).unwrap()
}

/// A raw byte-level session for protocol-shape tests.
fn raw_session() -> (UnixStream, BufReader<UnixStream>) {
    let (master, slave) = UnixStream::pair().unwrap();
    thread::spawn(move || {
        let _ = Server::new(slave).unwrap().run();
    });
    let mut reader = BufReader::new(master.try_clone().unwrap());
    let mut greeting = String::new();
    reader.read_line(&mut greeting).unwrap();
    assert!(greeting.starts_with("220 "), "greeting was {greeting:?}");
    (master, reader)
}

fn roundtrip(stream: &mut UnixStream, reader: &mut BufReader<UnixStream>, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
    let mut reply = String::new();
    loop {
        let mut one = String::new();
        reader.read_line(&mut one).unwrap();
        let terminal = one.len() >= 4 && one.as_bytes()[3] == b' ';
        reply.push_str(&one);
        if terminal {
            return reply;
        }
    }
}

#[test]
fn orderly_shutdown() {
    let mut client = session();
    client.shutdown().unwrap();
}

#[test]
fn if_list_sees_loopback() {
    if !kernel_tools() {
        return;
    }
    let mut client = session();
    let interfaces = client.get_if_data().unwrap();
    assert!(
        interfaces
            .iter()
            .any(|i| i.name.as_deref() == Some("lo")),
        "no lo in {interfaces:?}"
    );
    client.shutdown().unwrap();
}

#[test]
fn if_list_by_index_matches_full_list() {
    if !kernel_tools() {
        return;
    }
    let mut client = session();
    let interfaces = client.get_if_data().unwrap();
    let lo = interfaces
        .iter()
        .find(|i| i.name.as_deref() == Some("lo"))
        .unwrap();
    let fetched = client.get_if(lo.index.unwrap()).unwrap();
    assert_eq!(fetched.name, lo.name);
    assert_eq!(fetched.mtu, lo.mtu);
    client.shutdown().unwrap();
}

#[test]
fn poll_of_unknown_pid_is_a_key_error() {
    let mut client = session();
    match client.poll(999_999) {
        Err(Error::Remote(remote)) => assert_eq!(remote.kind, RemoteErrorKind::Key),
        other => panic!("unexpected: {other:?}"),
    }
    client.shutdown().unwrap();
}

#[test]
fn spawn_and_wait_reports_exit_code() {
    let mut client = session();
    let pid = client
        .spawn(&RemoteSpawn {
            argv: vec!["sh".into(), "-c".into(), "exit 5".into()],
            ..Default::default()
        })
        .unwrap();
    assert!(pid > 0);
    let status = client.wait(pid).unwrap();
    assert_eq!(decode_status(status), ExitStatus::Exited(5));
    client.shutdown().unwrap();
}

#[test]
fn wait_removes_child_from_tracking() {
    let mut client = session();
    let pid = client
        .spawn(&RemoteSpawn {
            argv: vec!["true".into()],
            ..Default::default()
        })
        .unwrap();
    client.wait(pid).unwrap();
    // a second wait on the same pid must be a key error: the set is empty
    match client.wait(pid) {
        Err(Error::Remote(remote)) => assert_eq!(remote.kind, RemoteErrorKind::Key),
        other => panic!("unexpected: {other:?}"),
    }
    client.shutdown().unwrap();
}

#[test]
fn all_children_reaped_after_batch() {
    let mut client = session();
    let pids: Vec<i32> = (0..5)
        .map(|_| {
            client
                .spawn(&RemoteSpawn {
                    argv: vec!["true".into()],
                    ..Default::default()
                })
                .unwrap()
        })
        .collect();
    for pid in &pids {
        client.wait(*pid).unwrap();
    }
    for pid in &pids {
        assert!(matches!(client.poll(*pid), Err(Error::Remote(_))));
    }
    client.shutdown().unwrap();
}

#[test]
fn spawn_missing_binary_is_a_remote_os_error() {
    let mut client = session();
    let err = client
        .spawn(&RemoteSpawn {
            argv: vec!["ns0-missing-binary".into()],
            ..Default::default()
        })
        .unwrap_err();
    match err {
        Error::Remote(remote) => {
            assert_eq!(remote.kind, RemoteErrorKind::Os);
            assert_eq!(remote.errno, Some(libc::ENOENT));
        }
        other => panic!("unexpected: {other}"),
    }
    // the session survives the failed build
    assert!(matches!(client.poll(999_999), Err(Error::Remote(_))));
    client.shutdown().unwrap();
}

#[test]
fn spawn_with_piped_stdout() {
    let mut client = session();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let pid = client
        .spawn(&RemoteSpawn {
            argv: vec!["echo".into(), "over the wire".into()],
            stdout: Some(write_end.as_fd()),
            ..Default::default()
        })
        .unwrap();
    drop(write_end);
    let mut out = String::new();
    std::fs::File::from(read_end)
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "over the wire\n");
    let status = client.wait(pid).unwrap();
    assert_eq!(decode_status(status), ExitStatus::Exited(0));
    client.shutdown().unwrap();
}

#[test]
fn spawn_with_environment_and_cwd() {
    let mut client = session();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let pid = client
        .spawn(&RemoteSpawn {
            argv: vec!["sh".into(), "-c".into(), "echo \"$PLACE:$(pwd)\"".into()],
            env: Some(vec![("PLACE".into(), "here".into())]),
            cwd: Some("/".into()),
            stdout: Some(write_end.as_fd()),
            ..Default::default()
        })
        .unwrap();
    drop(write_end);
    let mut out = String::new();
    std::fs::File::from(read_end)
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "here:/\n");
    client.wait(pid).unwrap();
    client.shutdown().unwrap();
}

#[test]
fn signal_terminates_child() {
    let mut client = session();
    let pid = client
        .spawn(&RemoteSpawn {
            argv: vec!["sleep".into(), "30".into()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(client.poll(pid).unwrap(), None);
    client.signal(pid, None).unwrap();
    let status = client.wait(pid).unwrap();
    assert_eq!(decode_status(status), ExitStatus::Signaled(libc::SIGTERM));
    client.shutdown().unwrap();
}

#[test]
fn route_listing_parses_host_tables() {
    if !kernel_tools() {
        return;
    }
    let mut client = session();
    client.get_route_data().unwrap();
    client.shutdown().unwrap();
}

#[test]
fn addr_listing_parses_host_addresses() {
    if !kernel_tools() {
        return;
    }
    let mut client = session();
    let by_index = client.get_addr_data().unwrap();
    // lo carries 127.0.0.1 everywhere these tests can run
    let all: Vec<_> = by_index.values().flatten().collect();
    assert!(
        all.iter().any(|a| a.ip().to_string() == "127.0.0.1"),
        "no loopback address in {all:?}"
    );
    client.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Raw protocol shape
// ---------------------------------------------------------------------------

#[test]
fn unknown_command_gets_500() {
    let (mut stream, mut reader) = raw_session();
    let reply = roundtrip(&mut stream, &mut reader, "FROB");
    assert!(reply.starts_with("500 "), "{reply:?}");
    let reply = roundtrip(&mut stream, &mut reader, "QUIT");
    assert!(reply.starts_with("221 "), "{reply:?}");
}

#[test]
fn unknown_subcommand_gets_500() {
    let (mut stream, mut reader) = raw_session();
    let reply = roundtrip(&mut stream, &mut reader, "IF FROB 1");
    assert!(reply.starts_with("500 "), "{reply:?}");
}

#[test]
fn arity_errors_get_500() {
    let (mut stream, mut reader) = raw_session();
    assert!(roundtrip(&mut stream, &mut reader, "IF DEL").starts_with("500 "));
    assert!(roundtrip(&mut stream, &mut reader, "IF DEL 1 2").starts_with("500 "));
    assert!(roundtrip(&mut stream, &mut reader, "IF DEL abc").starts_with("500 "));
}

#[test]
fn build_commands_rejected_outside_build_mode() {
    let (mut stream, mut reader) = raw_session();
    for cmd in ["PROC RUN", "PROC ABRT", "PROC USER nobody", "PROC SIN"] {
        let reply = roundtrip(&mut stream, &mut reader, cmd);
        assert!(reply.starts_with("500 "), "{cmd}: {reply:?}");
    }
    // the session is unharmed: dispatch still reaches handlers
    assert!(roundtrip(&mut stream, &mut reader, "PROC POLL 1").starts_with("550"));
}

#[test]
fn base_command_aborts_open_build() {
    let (mut stream, mut reader) = raw_session();
    assert!(roundtrip(&mut stream, &mut reader, "PROC CRTE true").starts_with("200 "));
    // base command while building: rejected, and the build is gone
    assert!(roundtrip(&mut stream, &mut reader, "PROC POLL 1").starts_with("500 "));
    // back in base mode, the same command reaches its handler (key error)
    assert!(roundtrip(&mut stream, &mut reader, "PROC POLL 1").starts_with("550"));
    // RUN now has nothing to run
    assert!(roundtrip(&mut stream, &mut reader, "PROC RUN").starts_with("500 "));
}

#[test]
fn abort_closes_build_mode() {
    let (mut stream, mut reader) = raw_session();
    assert!(roundtrip(&mut stream, &mut reader, "PROC CRTE true").starts_with("200 "));
    assert!(roundtrip(&mut stream, &mut reader, "PROC ABRT").starts_with("200 "));
    assert!(roundtrip(&mut stream, &mut reader, "IF LIST").starts_with("200 "));
}

#[test]
fn build_survives_malformed_build_command() {
    let (mut stream, mut reader) = raw_session();
    assert!(roundtrip(&mut stream, &mut reader, "PROC CRTE true").starts_with("200 "));
    // arity error on a build command: still in build mode afterwards
    assert!(roundtrip(&mut stream, &mut reader, "PROC USER").starts_with("500 "));
    assert!(roundtrip(&mut stream, &mut reader, "PROC RUN").starts_with("200 "));
}

#[test]
fn help_lists_commands() {
    let (mut stream, mut reader) = raw_session();
    let reply = roundtrip(&mut stream, &mut reader, "HELP");
    assert!(reply.contains("PROC CRTE"), "{reply:?}");
    assert!(reply.contains("IF SET"), "{reply:?}");
}

#[test]
fn empty_line_gets_500() {
    let (mut stream, mut reader) = raw_session();
    let reply = roundtrip(&mut stream, &mut reader, "   ");
    assert!(reply.starts_with("500 "), "{reply:?}");
}

#[test]
fn eof_shuts_the_slave_down() {
    let (master, slave) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || Server::new(slave).unwrap().run());
    {
        let mut reader = BufReader::new(master.try_clone().unwrap());
        let mut greeting = String::new();
        reader.read_line(&mut greeting).unwrap();
    }
    drop(master);
    handle.join().unwrap().unwrap();
}
