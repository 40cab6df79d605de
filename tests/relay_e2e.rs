//! Full stack: GETFILE over TCP, POSIX message queue, shared memory segments.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gfcache::control::{PosixQueue, RetryPolicy};
use gfcache::daemon::CacheDaemon;
use gfcache::gfclient::fetch;
use gfcache::gfserver::GfServer;
use gfcache::pool::SegmentPool;
use gfcache::protocol::GfStatus;
use gfcache::resolver::FileResolver;
use gfcache::transfer::CacheRelay;
use uuid::Uuid;

struct Stack {
    addr: SocketAddr,
    pool: Arc<SegmentPool>,
    queue_name: String,
    _dir: tempfile::TempDir,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.pool.teardown();
        let _ = PosixQueue::unlink(&self.queue_name);
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        interval: Duration::from_millis(10),
        attempts: Some(300),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Segments are released just after the last body byte goes out.
fn wait_all_free(pool: &SegmentPool) -> usize {
    for _ in 0..200 {
        if pool.free_count() == pool.len() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pool.free_count()
}

fn write_manifest(dir: &Path, files: &[(&str, &[u8])]) -> std::path::PathBuf {
    let mut manifest = String::from("# request-path local-file\n");
    for (name, data) in files {
        fs::write(dir.join(name), data).unwrap();
        manifest.push_str(&format!("/{} {}\n", name, name));
    }
    let path = dir.join("locals.txt");
    fs::write(&path, manifest).unwrap();
    path
}

/// Start daemon workers, proxy pool and GETFILE server. The daemon opens the
/// queue before the proxy creates it to exercise the retry path.
fn start(segments: usize, region: usize, workers: usize, files: &[(&str, &[u8])]) -> Stack {
    let id = Uuid::new_v4().simple().to_string();
    let prefix = format!("/gfc_e2e_{}_", id);
    let queue_name = format!("/gfc_e2e_q_{}", id);
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path(), files);
    let resolver = Arc::new(FileResolver::from_cache_dir(&manifest).unwrap());

    {
        let queue_name = queue_name.clone();
        let prefix = prefix.clone();
        // Never joined: workers stay blocked in mq_receive until the test exits
        thread::spawn(move || {
            let queue = Arc::new(PosixQueue::open(&queue_name, quick_retry()).unwrap());
            let daemon = Arc::new(CacheDaemon::new(queue, resolver, &prefix));
            daemon.run(workers)
        });
    }

    let pool = Arc::new(SegmentPool::initialize(&prefix, segments, region).unwrap());
    let queue = Arc::new(PosixQueue::create(&queue_name, 10, 4096).unwrap());
    let relay = CacheRelay::new(Arc::clone(&pool), queue);
    let server = GfServer::bind("127.0.0.1:0", Arc::new(relay))
        .unwrap()
        .with_workers(8);
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());

    Stack {
        addr,
        pool,
        queue_name,
        _dir: dir,
    }
}

#[test]
fn serves_manifest_entries_and_reports_missing_ones() {
    let stack = start(1, 16, 1, &[("a.txt", b"hello from the cache daemon\n")]);

    let resp = fetch(stack.addr, "/a.txt").unwrap();
    assert_eq!(resp.status, GfStatus::Ok);
    assert_eq!(resp.body, b"hello from the cache daemon\n");

    let resp = fetch(stack.addr, "/missing.txt").unwrap();
    assert_eq!(resp.status, GfStatus::FileNotFound);

    assert_eq!(wait_all_free(&stack.pool), 1);
}

#[test]
fn empty_file_is_ok_with_no_body() {
    let stack = start(1, 64, 1, &[("empty", b"")]);
    let resp = fetch(stack.addr, "/empty").unwrap();
    assert_eq!(resp.status, GfStatus::Ok);
    assert!(resp.body.is_empty());
}

#[test]
fn concurrent_clients_share_a_small_pool() {
    let big = pattern(100_000);
    let small = pattern(777);
    let stack = start(2, 4096, 2, &[("big.bin", &big), ("small.bin", &small)]);

    let clients: Vec<_> = (0..8)
        .map(|i| {
            let addr = stack.addr;
            thread::spawn(move || {
                let path = if i % 2 == 0 { "/big.bin" } else { "/small.bin" };
                (i, fetch(addr, path).unwrap())
            })
        })
        .collect();

    for c in clients {
        let (i, resp) = c.join().unwrap();
        assert_eq!(resp.status, GfStatus::Ok);
        if i % 2 == 0 {
            assert_eq!(resp.body, big);
        } else {
            assert_eq!(resp.body, small);
        }
    }
    assert_eq!(wait_all_free(&stack.pool), 2);
}

#[test]
fn malformed_paths_never_reach_the_daemon() {
    let stack = start(1, 16, 1, &[("a.txt", b"abc")]);
    let resp = fetch(stack.addr, "relative.txt").unwrap();
    assert_eq!(resp.status, GfStatus::Invalid);

    let resp = fetch(stack.addr, "/a.txt").unwrap();
    assert_eq!(resp.body, b"abc");
}
