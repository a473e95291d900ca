//! Client behavior against the loopback server.

use fnfs_core::{
    BlockNumber, BufFlags, Credential, Cx, FileId, FlushMode, GetFlags, InvalidateMode, NfsError,
    TransportKind, procs,
};
use fnfs_harness::{Fixture, LoopbackConnector, LoopbackServer, SERVER, test_config, wait_until};
use fnfs_types::StableHow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FILE: FileId = FileId(7);
const LONG: Duration = Duration::from_secs(5);

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

fn tcp() -> Fixture {
    Fixture::mount(test_config(TransportKind::Tcp)).expect("mount")
}

#[test]
fn flush_twice_sends_nothing_the_second_time() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(10_000, 1);
    fx.client.write(&cx, FILE, 0, &data, false).expect("write");
    assert_eq!(fx.server.call_count(procs::WRITE), 0, "write is delayed");

    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("flush");
    let after_first = fx.server.data_calls();
    assert!(after_first >= 2, "a write and a commit");
    assert_eq!(fx.server.durable(FILE).expect("file"), data);

    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("flush again");
    assert_eq!(fx.server.data_calls(), after_first);
}

#[test]
fn written_data_reads_back_without_read_rpc() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(20_000, 9);
    fx.client.write(&cx, FILE, 5, &data, false).expect("write");
    let back = fx.client.read(&cx, FILE, 5, data.len()).expect("read");
    assert_eq!(back, data);
    let head = fx.client.read(&cx, FILE, 0, 5).expect("read head");
    assert_eq!(head, vec![0; 5]);
    assert_eq!(fx.server.call_count(procs::READ), 0);
}

#[test]
fn cached_pages_are_not_read_twice() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let bs = fx.client.config().buffer_size;
    let contents = pattern(3 * bs + 100, 3);
    fx.seed(FILE, &contents);

    let all = fx.client.read(&cx, FILE, 0, contents.len() + 50).expect("read");
    assert_eq!(all, contents, "short at end of file");
    let reads = fx.server.call_count(procs::READ);
    assert_eq!(reads, 4, "one READ per block");

    let middle = fx.client.read(&cx, FILE, bs as u64 - 10, 20).expect("read");
    assert_eq!(middle, contents[bs - 10..bs + 10]);
    assert_eq!(fx.server.call_count(procs::READ), reads);
    assert!(fx.client.read(&cx, FILE, contents.len() as u64, 10).expect("eof").is_empty());
}

#[test]
fn readahead_fills_following_blocks() {
    let mut config = test_config(TransportKind::Tcp);
    config.readahead = 2;
    let fx = Fixture::mount(config).expect("mount");
    let cx = Cx::for_testing();
    let bs = fx.client.config().buffer_size;
    let contents = pattern(4 * bs, 5);
    fx.seed(FILE, &contents);

    fx.client.read(&cx, FILE, 0, 100).expect("read");
    let ready = |block: u64| {
        fx.client
            .cache()
            .incore(FILE, BlockNumber(block))
            .is_some_and(|info| !info.busy && info.valid.is_some_and(|v| v.count() == bs / 4096))
    };
    assert!(wait_until(LONG, || ready(1) && ready(2)));
    assert!(fx.client.cache().incore(FILE, BlockNumber(3)).is_none());

    let reads = fx.server.call_count(procs::READ);
    let got = fx.client.read(&cx, FILE, bs as u64, bs).expect("read block 1");
    assert_eq!(got, contents[bs..2 * bs]);
    assert!(fx.client.io().stats().readaheads >= 2);
    // Reading block 1 may start readahead of block 3 but never re-reads 1.
    assert!(fx.server.call_count(procs::READ) <= reads + 1);
}

#[test]
fn partial_page_write_reads_the_rest_of_the_page() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let contents = pattern(8192, 11);
    fx.seed(FILE, &contents);

    fx.client.write(&cx, FILE, 100, b"patch", false).expect("write");
    assert_eq!(fx.server.call_count(procs::READ), 1, "read-modify-write of page 0");
    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("flush");

    let mut expected = contents;
    expected[100..105].copy_from_slice(b"patch");
    assert_eq!(fx.server.durable(FILE).expect("file"), expected);
}

#[test]
fn unstable_write_needs_commit_until_committed() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(8192, 2);
    fx.client.write(&cx, FILE, 0, &data, false).expect("write");
    fx.client.flush(&cx, FILE, FlushMode::NoWait).expect("start write");
    assert!(wait_until(LONG, || fx.client.io().writes_in_flight(FILE) == 0));

    let info = fx.client.cache().incore(FILE, BlockNumber(0)).expect("cached");
    assert!(info.flags.contains(BufFlags::NEEDS_COMMIT));
    assert!(info.flags.contains(BufFlags::DELWRI));
    assert_eq!(info.dirty_range, Some((0, 8192)));
    assert!(info.dirty.is_some_and(|d| !d.is_any_set()));
    let writes = fx.server.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].stable, StableHow::Unstable);
    assert_eq!(fx.server.durable(FILE).expect("file"), Vec::<u8>::new());

    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("commit");
    assert_eq!(fx.server.call_count(procs::COMMIT), 1);
    assert_eq!(fx.server.call_count(procs::WRITE), 1);
    let info = fx.client.cache().incore(FILE, BlockNumber(0)).expect("cached");
    assert!(!info.flags.intersects(BufFlags::NEEDS_COMMIT | BufFlags::DELWRI));
    assert_eq!(info.dirty_range, None);
    assert_eq!(fx.server.durable(FILE).expect("file"), data);
}

#[test]
fn commit_after_server_reboot_rewrites_stable() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(12_288, 4);
    fx.client.write(&cx, FILE, 0, &data, false).expect("write");
    fx.client.flush(&cx, FILE, FlushMode::NoWait).expect("start write");
    assert!(wait_until(LONG, || fx.client.io().writes_in_flight(FILE) == 0));

    fx.server.reboot();
    assert_eq!(fx.server.file(FILE).expect("file"), Vec::<u8>::new(), "unstable data lost");

    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("flush surfaces no error");
    let writes = fx.server.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].stable, StableHow::FileSync);
    assert_eq!(fx.server.durable(FILE).expect("file"), data);
    assert!(fx.client.io().stats().stale_rewrites >= 1);
    assert!(fx.client.cache().dirty_blocks(FILE).is_empty());
}

#[test]
fn chunks_answered_under_different_verifiers_are_rewritten() {
    let mut config = test_config(TransportKind::Tcp);
    config.write_size = 8192;
    config.read_size = 8192;
    let fx = Fixture::mount(config).expect("mount");
    let cx = Cx::for_testing();
    let bs = fx.client.config().buffer_size;
    let data = pattern(bs, 6);

    fx.server.reboot_after_writes(2);
    fx.client.write(&cx, FILE, 0, &data, true).expect("sync write");

    let chunks = bs / 8192;
    assert_eq!(fx.server.call_count(procs::WRITE), 2 * chunks);
    assert_eq!(fx.client.io().stats().stale_rewrites, 1);
    assert_eq!(fx.server.durable(FILE).expect("file"), data);
    let info = fx.client.cache().incore(FILE, BlockNumber(0)).expect("cached");
    assert!(!info.flags.intersects(BufFlags::MULTI_RPC | BufFlags::DELWRI));
}

#[test]
fn try_later_is_resent_after_backoff() {
    let fx = tcp();
    let cx = Cx::for_testing();
    fx.server.try_later(procs::WRITE, 2);
    let started = Instant::now();
    fx.client.write(&cx, FILE, 0, &pattern(4096, 8), true).expect("write");
    assert!(started.elapsed() >= Duration::from_millis(60), "20ms then 40ms");

    assert_eq!(fx.server.call_count(procs::WRITE), 3);
    let stats = fx.client.rpc().stats();
    assert_eq!(stats.try_later, 2);
    assert_eq!(stats.timeouts, 0);
}

#[test]
fn try_later_budget_is_separate_and_bounded() {
    let mut config = test_config(TransportKind::Tcp);
    config.try_later_budget = 1;
    config.retrans = 0;
    let fx = Fixture::mount(config).expect("mount");
    fx.server.try_later(procs::GETATTR, 5);
    let err = fx
        .client
        .call(&Cx::for_testing(), procs::GETATTR, &Credential::default(), &[1, 2])
        .expect_err("budget exhausted");
    assert!(matches!(err, NfsError::ServerTryLater));
    assert_eq!(fx.server.call_count(procs::GETATTR), 2);
}

#[test]
fn reconnect_resends_each_pending_request_once() {
    const N: usize = 5;
    let fx = tcp();
    fx.server.hold(true);
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..N {
        let tx = tx.clone();
        fx.client
            .call_async(procs::GETATTR, &Credential::default(), &[i as u8], move |r| {
                tx.send(r.map(|reply| reply.body)).expect("send");
            })
            .expect("call");
    }
    drop(tx);
    assert!(fx.server.wait_for_calls(procs::GETATTR, N, LONG));
    fx.server.hold(false);
    assert_eq!(fx.server.disconnect_all(), 1);

    let mut bodies = Vec::new();
    for _ in 0..N {
        let body = rx.recv_timeout(LONG).expect("callback").expect("reply");
        bodies.push(body[0]);
    }
    bodies.sort_unstable();
    assert_eq!(bodies, (0..N as u8).collect::<Vec<_>>());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "no double completion");

    let mut seen: HashMap<_, Vec<u64>> = HashMap::new();
    for call in fx.server.calls().into_iter().filter(|c| c.proc == procs::GETATTR) {
        seen.entry(call.xid).or_default().push(call.link);
    }
    assert_eq!(seen.len(), N);
    for links in seen.values() {
        assert_eq!(links.len(), 2, "sent once, resent once");
        assert_ne!(links[0], links[1]);
    }
    assert_eq!(fx.client.rpc().transport().reconnects(), 1);
    assert_eq!(fx.client.rpc().stats().retransmits, N as u64);
}

#[test]
fn requests_that_timed_out_while_disconnected_go_out_once_on_the_new_link() {
    const N: usize = 5;
    let fx = tcp();
    fx.server.hold(true);
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..N {
        let tx = tx.clone();
        fx.client
            .call_async(procs::GETATTR, &Credential::default(), &[i as u8], move |r| {
                tx.send(r.map(|reply| reply.body)).expect("send");
            })
            .expect("call");
    }
    drop(tx);
    assert!(fx.server.wait_for_calls(procs::GETATTR, N, LONG));
    let first_link = fx.server.calls()[0].link;

    fx.server.refuse(true);
    assert_eq!(fx.server.disconnect_all(), 1);
    assert!(wait_until(LONG, || fx.client.rpc().stats().timeouts >= N as u64));
    fx.server.hold(false);
    fx.server.refuse(false);

    for _ in 0..N {
        rx.recv_timeout(LONG).expect("callback").expect("reply");
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "no double completion");

    let mut resent: HashMap<_, usize> = HashMap::new();
    for call in fx.server.calls().into_iter().filter(|c| c.proc == procs::GETATTR) {
        if call.link != first_link {
            *resent.entry(call.xid).or_default() += 1;
        }
    }
    assert_eq!(resent.len(), N);
    assert!(resent.values().all(|&sends| sends == 1), "{resent:?}");
    assert_eq!(fx.client.rpc().stats().retransmits, N as u64);
}

#[test]
fn lost_datagram_reply_is_retransmitted() {
    let fx = Fixture::mount(test_config(TransportKind::Udp)).expect("mount");
    fx.server.drop_replies(procs::GETATTR, 1);
    let reply = fx
        .client
        .call(&Cx::for_testing(), procs::GETATTR, &Credential::default(), &[4, 2])
        .expect("answered on retry");
    assert_eq!(reply.body, vec![4, 2]);
    assert_eq!(fx.server.call_count(procs::GETATTR), 2);
    let stats = fx.client.rpc().stats();
    assert_eq!(stats.retransmits, 1);
    assert!(stats.timeouts >= 1);
    let window = fx.client.rpc().window().expect("datagram window");
    assert!(window.cwnd >= fnfs_rpc::CWND_SCALE);
}

#[test]
fn soft_mount_gives_up() {
    let mut config = test_config(TransportKind::Udp);
    config.soft = true;
    config.retrans = 1;
    config.max_timeout = Duration::from_millis(200);
    let fx = Fixture::mount(config).expect("mount");
    fx.server.drop_replies(procs::GETATTR, u32::MAX);
    let err = fx
        .client
        .call(&Cx::for_testing(), procs::GETATTR, &Credential::default(), &[])
        .expect_err("soft timeout");
    assert!(matches!(err, NfsError::Timeout(_)));
    assert_eq!(fx.server.call_count(procs::GETATTR), 2);
}

#[test]
fn fifth_get_waits_for_a_release() {
    let mut config = test_config(TransportKind::Tcp);
    config.max_buffers = 4;
    config.min_buffers = 4;
    config.max_meta_buffers = 4;
    let fx = Fixture::mount(config).expect("mount");
    let cx = Cx::for_testing();
    let mut held: Vec<_> = (0..4)
        .map(|b| {
            fx.client
                .get(&cx, FILE, BlockNumber(b), GetFlags::empty())
                .expect("get")
        })
        .collect();
    assert_eq!(fx.client.cache().stats().busy, 4);

    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::scope(|s| {
        let client = &fx.client;
        s.spawn(move || {
            let handle = client
                .get(&Cx::for_testing(), FILE, BlockNumber(4), GetFlags::empty())
                .expect("fifth get");
            tx.send(handle.block()).expect("send");
            client.release(handle, false);
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "pool exhausted");
        let freed = held.remove(2);
        fx.client.release(freed, false);
        assert_eq!(rx.recv_timeout(LONG).expect("unblocked"), BlockNumber(4));
    });

    let stats = fx.client.cache().stats();
    assert_eq!(stats.buffers, 4);
    assert!(fx.client.cache().incore(FILE, BlockNumber(2)).is_none(), "its buffer was reused");
    for handle in held {
        fx.client.release(handle, false);
    }
    fx.client.cache().check_invariants().expect("invariants");
}

#[test]
fn failed_write_is_reported_once_by_flush() {
    let fx = tcp();
    let cx = Cx::for_testing();
    fx.server.fail_with(procs::WRITE, 5, 1);
    fx.client.write(&cx, FILE, 0, &pattern(4096, 12), false).expect("write");
    let err = fx.client.flush(&cx, FILE, FlushMode::Wait).expect_err("EIO");
    assert!(matches!(err, NfsError::Server { status: 5 }));
    assert_eq!(fx.client.io().stats().write_errors, 1);
    assert!(fx.client.cache().dirty_blocks(FILE).is_empty());

    let calls = fx.server.data_calls();
    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("error already reported");
    assert_eq!(fx.server.data_calls(), calls);
}

#[test]
fn discarding_drops_dirty_data_unwritten() {
    let fx = tcp();
    let cx = Cx::for_testing();
    fx.client.write(&cx, FILE, 0, &pattern(4096, 13), false).expect("write");
    fx.client
        .invalidate_all(&cx, FILE, InvalidateMode::Discard)
        .expect("discard");
    assert!(fx.client.cache().incore(FILE, BlockNumber(0)).is_none());
    fx.client.flush(&cx, FILE, FlushMode::Wait).expect("nothing to flush");
    assert_eq!(fx.server.call_count(procs::WRITE), 0);
}

#[test]
fn invalidating_with_flush_writes_first() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(4096, 14);
    fx.client.write(&cx, FILE, 0, &data, false).expect("write");
    fx.client
        .invalidate_all(&cx, FILE, InvalidateMode::Flush)
        .expect("invalidate");
    assert_eq!(fx.server.durable(FILE).expect("file"), data);
    assert!(fx.client.cache().incore(FILE, BlockNumber(0)).is_none());
    let back = fx.client.read(&cx, FILE, 0, data.len()).expect("read");
    assert_eq!(back, data);
    assert_eq!(fx.server.call_count(procs::READ), 1);
}

#[test]
fn delayed_write_limit_forces_synchronous_writes() {
    let mut config = test_config(TransportKind::Tcp);
    config.max_delayed_writes = 2;
    let fx = Fixture::mount(config).expect("mount");
    let cx = Cx::for_testing();
    let bs = fx.client.config().buffer_size;
    fx.client.write(&cx, FILE, 0, &pattern(3 * bs, 15), false).expect("write");
    assert!(fx.client.io().stats().pressure_writes >= 1);
    assert!(fx.server.call_count(procs::WRITE) >= 1);
}

#[test]
fn flusher_writes_back_in_the_background() {
    let mut config = test_config(TransportKind::Tcp);
    config.flush_period = Duration::from_millis(20);
    let fx = Fixture::mount(config).expect("mount");
    let data = pattern(6000, 16);
    fx.client.write(&Cx::for_testing(), FILE, 0, &data, false).expect("write");
    assert!(wait_until(LONG, || fx.server.durable(FILE).is_some_and(|d| d == data)));
    assert!(wait_until(LONG, || fx.client.cache().dirty_blocks(FILE).is_empty()));
}

#[test]
fn unmount_writes_back_and_rejects_further_io() {
    let fx = tcp();
    let cx = Cx::for_testing();
    let data = pattern(5000, 17);
    fx.client.write(&cx, FILE, 0, &data, false).expect("write");
    fx.client.unmount(&cx).expect("unmount");
    assert_eq!(fx.server.durable(FILE).expect("file"), data);
    assert!(!fx.client.is_mounted());
    assert!(matches!(fx.client.read(&cx, FILE, 0, 10), Err(NfsError::Shutdown)));
    fx.client.unmount(&cx).expect("second unmount is a no-op");
    assert_eq!(fx.server.connections(), 0);
}

#[test]
fn mount_searches_past_dead_servers() {
    let server = LoopbackServer::new("up");
    let config = test_config(TransportKind::Tcp).with_servers(["down", "up"]);
    let fx = Fixture::mount_on(server, config).expect("mount");
    assert_eq!(fx.client.rpc().transport().peer().as_deref(), Some("up"));
}

#[test]
fn mount_fails_when_nobody_answers() {
    let server = LoopbackServer::new(SERVER);
    server.refuse(true);
    let err = Fixture::mount_on(server, test_config(TransportKind::Tcp)).expect_err("refused");
    assert!(err.is_connection_level() || matches!(err, NfsError::Io(_)));
}

#[test]
fn connector_kind_must_match_the_mount() {
    let server = LoopbackServer::new(SERVER);
    let connector = LoopbackConnector::new(TransportKind::Udp).with_server(&server);
    let err = fnfs_core::NfsClient::mount(
        &Cx::for_testing(),
        test_config(TransportKind::Tcp),
        Arc::new(connector),
        Arc::new(fnfs_core::AnonymousPages::new()),
        Arc::new(fnfs_core::WireCodec),
        Arc::new(fnfs_core::StaticCredentials::default()),
    )
    .expect_err("mismatch");
    assert!(matches!(err, NfsError::InvalidConfig(_)));
}
