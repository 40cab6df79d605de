//! Control channel: assigns a request to a segment and to whichever daemon
//! worker dequeues it first.
//!
//! Wire format is one UTF-8 line per message:
//!
//! ```text
//! Request: <segment_id> <region_size> <path>
//! ```
//!
//! The path is the final token and never contains whitespace. A single
//! queue is shared by all workers, so an idle worker always picks up the
//! next request.

use std::ffi::CString;
use std::io;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::protocol::control::TAG;

/// One request assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub segment_id: usize,
    pub region_size: usize,
    pub path: String,
}

impl ControlMessage {
    pub fn new(segment_id: usize, region_size: usize, path: &str) -> Self {
        ControlMessage {
            segment_id,
            region_size,
            path: path.to_string(),
        }
    }

    /// True when `path` can travel as the final message token.
    pub fn carries_path(path: &str) -> bool {
        !path.is_empty() && !path.chars().any(|c| c.is_whitespace() || c == '\0')
    }

    /// Encode, failing if the result exceeds `max_len` bytes.
    pub fn encode(&self, max_len: usize) -> Result<Vec<u8>> {
        if !Self::carries_path(&self.path) {
            return Err(CacheError::InvalidPath(self.path.clone()));
        }
        let line = format!(
            "{} {} {} {}",
            TAG, self.segment_id, self.region_size, self.path
        );
        if line.len() > max_len {
            return Err(CacheError::MessageTooLong {
                len: line.len(),
                max: max_len,
            });
        }
        Ok(line.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CacheError::MalformedMessage("not utf-8".into()))?;
        // Receivers may hand us a zero-padded buffer
        let text = text.trim_end_matches('\0');
        let malformed = || CacheError::MalformedMessage(text.to_string());

        let mut parts = text.split(' ');
        if parts.next() != Some(TAG) {
            return Err(malformed());
        }
        let segment_id = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        let region_size = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(malformed)?;
        let path = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() || !Self::carries_path(path) {
            return Err(malformed());
        }
        Ok(ControlMessage {
            segment_id,
            region_size,
            path: path.to_string(),
        })
    }
}

/// A bounded multi-producer, multi-consumer request queue. Each message is
/// delivered to exactly one `receive` caller.
pub trait RequestQueue: Send + Sync {
    /// Enqueue, blocking while the queue is full.
    fn send(&self, msg: &ControlMessage) -> Result<()>;

    /// Dequeue, blocking while the queue is empty.
    fn receive(&self) -> Result<ControlMessage>;

    /// Maximum number of undelivered messages.
    fn capacity(&self) -> usize;
}

/// How long a consumer keeps trying to open a queue nobody created yet.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// None retries forever.
    pub attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_millis(100),
            attempts: None,
        }
    }
}

/// Kernel-backed POSIX message queue.
pub struct PosixQueue {
    name: String,
    mqd: libc::mqd_t,
    capacity: usize,
    msg_size: usize,
}

impl PosixQueue {
    /// Producer side: remove any leftover queue with this name, then create
    /// a fresh one holding `capacity` messages of at most `msg_size` bytes.
    pub fn create(name: &str, capacity: usize, msg_size: usize) -> Result<Self> {
        if Self::unlink(name)? {
            log::warn!("removed stale control queue {}", name);
        }
        let c_name = queue_name(name)?;
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = capacity as libc::c_long;
        attr.mq_msgsize = msg_size as libc::c_long;
        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o644 as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd < 0 {
            return Err(CacheError::queue("create", name, io::Error::last_os_error()));
        }
        Ok(PosixQueue {
            name: name.to_string(),
            mqd,
            capacity,
            msg_size,
        })
    }

    /// Consumer side: open an existing queue, retrying per `retry` while the
    /// producer has not created it yet.
    pub fn open(name: &str, retry: RetryPolicy) -> Result<Self> {
        let c_name = queue_name(name)?;
        let mut attempt: u32 = 0;
        let mqd = loop {
            let mqd = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_RDWR) };
            if mqd >= 0 {
                break mqd;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(CacheError::queue("open", name, err));
            }
            attempt += 1;
            if retry.attempts.is_some_and(|max| attempt >= max) {
                return Err(CacheError::queue("open", name, err));
            }
            if attempt == 1 {
                log::info!("waiting for control queue {} to appear", name);
            }
            thread::sleep(retry.interval);
        };

        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        if unsafe { libc::mq_getattr(mqd, &mut attr) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::mq_close(mqd) };
            return Err(CacheError::queue("getattr", name, err));
        }
        Ok(PosixQueue {
            name: name.to_string(),
            mqd,
            capacity: attr.mq_maxmsg as usize,
            msg_size: attr.mq_msgsize as usize,
        })
    }

    /// Remove the queue name. Returns false when nothing was there.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = queue_name(name)?;
        if unsafe { libc::mq_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(CacheError::queue("unlink", name, err))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_size(&self) -> usize {
        self.msg_size
    }

    /// Unlink the queue; open descriptors stay usable until dropped.
    pub fn close(&self) -> Result<()> {
        Self::unlink(&self.name).map(|_| ())
    }
}

impl RequestQueue for PosixQueue {
    fn send(&self, msg: &ControlMessage) -> Result<()> {
        let bytes = msg.encode(self.msg_size)?;
        loop {
            let rc = unsafe {
                libc::mq_send(
                    self.mqd,
                    bytes.as_ptr() as *const libc::c_char,
                    bytes.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(CacheError::queue("send", &self.name, err));
            }
        }
    }

    fn receive(&self) -> Result<ControlMessage> {
        let mut buf = vec![0u8; self.msg_size];
        loop {
            let n = unsafe {
                libc::mq_receive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    std::ptr::null_mut(),
                )
            };
            if n >= 0 {
                return ControlMessage::decode(&buf[..n as usize]);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(CacheError::queue("receive", &self.name, err));
            }
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

fn queue_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| {
        CacheError::queue(
            "name",
            name,
            io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
        )
    })
}

/// In-process bounded queue with the same encoding and size limit as the
/// kernel queue. Used when proxy and workers share one process.
pub struct LocalQueue {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
    capacity: usize,
    msg_size: usize,
}

impl LocalQueue {
    pub fn new(capacity: usize, msg_size: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        LocalQueue {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
            msg_size,
        }
    }

    /// Stop accepting messages. Receivers drain what is queued, then get
    /// `QueueClosed`.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl RequestQueue for LocalQueue {
    fn send(&self, msg: &ControlMessage) -> Result<()> {
        let bytes = msg.encode(self.msg_size)?;
        // Clone out of the lock so a blocked sender never holds it
        let tx = self.tx.lock().clone().ok_or(CacheError::QueueClosed)?;
        tx.send(bytes).map_err(|_| CacheError::QueueClosed)
    }

    fn receive(&self) -> Result<ControlMessage> {
        let bytes = self.rx.recv().map_err(|_| CacheError::QueueClosed)?;
        ControlMessage::decode(&bytes)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::control::{MAX_MSG_NUM, MAX_MSG_SIZE};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn encodes_the_request_line() {
        let msg = ControlMessage::new(3, 1024, "/courses/ud923/file.jpg");
        let bytes = msg.encode(MAX_MSG_SIZE).unwrap();
        assert_eq!(bytes, b"Request: 3 1024 /courses/ud923/file.jpg");
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_tolerates_zero_padding() {
        let mut raw = b"Request: 0 10 /a".to_vec();
        raw.resize(64, 0);
        let msg = ControlMessage::decode(&raw).unwrap();
        assert_eq!(msg, ControlMessage::new(0, 10, "/a"));
    }

    #[test]
    fn decode_rejects_garbage() {
        for raw in [
            &b"Reply: 0 10 /a"[..],
            b"Request: x 10 /a",
            b"Request: 0 -4 /a",
            b"Request: 0 10",
            b"Request: 0 10 /a extra",
            b"\xff\xfe",
        ] {
            assert!(
                matches!(ControlMessage::decode(raw), Err(CacheError::MalformedMessage(_))),
                "{:?}",
                raw
            );
        }
    }

    #[test]
    fn encode_overflow_and_spaces_are_rejected() {
        let long = format!("/{}", "a".repeat(64));
        assert!(matches!(
            ControlMessage::new(0, 10, &long).encode(32),
            Err(CacheError::MessageTooLong { max: 32, .. })
        ));
        assert!(matches!(
            ControlMessage::new(0, 10, "/has space").encode(MAX_MSG_SIZE),
            Err(CacheError::InvalidPath(_))
        ));
    }

    #[test]
    fn local_queue_blocks_producers_when_full() {
        let queue = Arc::new(LocalQueue::new(2, MAX_MSG_SIZE));
        queue.send(&ControlMessage::new(0, 8, "/a")).unwrap();
        queue.send(&ControlMessage::new(1, 8, "/b")).unwrap();
        assert_eq!(queue.len(), 2);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.send(&ControlMessage::new(2, 8, "/c")))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        assert_eq!(queue.receive().unwrap().segment_id, 0);
        producer.join().unwrap().unwrap();
        assert_eq!(queue.receive().unwrap().segment_id, 1);
        assert_eq!(queue.receive().unwrap().segment_id, 2);
    }

    #[test]
    fn local_queue_delivers_each_message_once() {
        let queue = Arc::new(LocalQueue::new(MAX_MSG_NUM, MAX_MSG_SIZE));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let delivered = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let seen = Arc::clone(&seen);
                let delivered = Arc::clone(&delivered);
                thread::spawn(move || {
                    while let Ok(msg) = queue.receive() {
                        assert!(seen.lock().insert(msg.segment_id));
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for id in 0..100 {
            queue.send(&ControlMessage::new(id, 16, "/f")).unwrap();
        }
        queue.close();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 100);
        assert!(matches!(
            queue.send(&ControlMessage::new(0, 16, "/f")),
            Err(CacheError::QueueClosed)
        ));
    }

    #[test]
    fn posix_queue_round_trip() {
        let name = format!("/gfc_test_q_{}", uuid::Uuid::new_v4().simple());
        let producer = PosixQueue::create(&name, MAX_MSG_NUM, MAX_MSG_SIZE).unwrap();
        let consumer = PosixQueue::open(&name, RetryPolicy::default()).unwrap();
        assert_eq!(consumer.capacity(), MAX_MSG_NUM);
        assert_eq!(consumer.message_size(), MAX_MSG_SIZE);

        producer.send(&ControlMessage::new(4, 4096, "/x.bin")).unwrap();
        assert_eq!(
            consumer.receive().unwrap(),
            ControlMessage::new(4, 4096, "/x.bin")
        );
        producer.close().unwrap();
        assert!(!PosixQueue::unlink(&name).unwrap());
    }

    struct Unlink(String);
    impl Drop for Unlink {
        fn drop(&mut self) {
            let _ = PosixQueue::unlink(&self.0);
        }
    }

    #[test]
    fn posix_queue_blocks_producers_when_full() {
        let name = format!("/gfc_test_full_{}", uuid::Uuid::new_v4().simple());
        let _guard = Unlink(name.clone());
        let producer = Arc::new(PosixQueue::create(&name, 2, MAX_MSG_SIZE).unwrap());
        let consumer = PosixQueue::open(&name, RetryPolicy::default()).unwrap();
        producer.send(&ControlMessage::new(0, 8, "/a")).unwrap();
        producer.send(&ControlMessage::new(1, 8, "/b")).unwrap();

        let blocked = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || producer.send(&ControlMessage::new(2, 8, "/c")))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        assert_eq!(consumer.receive().unwrap().segment_id, 0);
        blocked.join().unwrap().unwrap();
        assert_eq!(consumer.receive().unwrap().segment_id, 1);
        assert_eq!(consumer.receive().unwrap().segment_id, 2);
    }

    #[test]
    fn posix_queue_delivers_each_message_once() {
        let name = format!("/gfc_test_many_{}", uuid::Uuid::new_v4().simple());
        let _guard = Unlink(name.clone());
        let producer = PosixQueue::create(&name, 2, MAX_MSG_SIZE).unwrap();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let delivered = Arc::new(AtomicUsize::new(0));

        // Kernel queues cannot be closed under a blocked receiver, so each
        // worker stops on its own "/stop" message
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let consumer = PosixQueue::open(&name, RetryPolicy::default()).unwrap();
                let seen = Arc::clone(&seen);
                let delivered = Arc::clone(&delivered);
                thread::spawn(move || loop {
                    let msg = consumer.receive().unwrap();
                    if msg.path == "/stop" {
                        break;
                    }
                    assert!(seen.lock().insert(msg.segment_id));
                    delivered.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for id in 0..100 {
            producer.send(&ControlMessage::new(id, 16, "/f")).unwrap();
        }
        for _ in 0..4 {
            producer.send(&ControlMessage::new(0, 16, "/stop")).unwrap();
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 100);
        assert_eq!(seen.lock().len(), 100);
    }

    #[test]
    fn posix_open_gives_up_after_retry_budget() {
        let name = format!("/gfc_test_missing_{}", uuid::Uuid::new_v4().simple());
        let retry = RetryPolicy {
            interval: Duration::from_millis(1),
            attempts: Some(3),
        };
        let err = PosixQueue::open(&name, retry).err().unwrap();
        assert!(matches!(err, CacheError::Queue { op: "open", .. }));
    }
}
