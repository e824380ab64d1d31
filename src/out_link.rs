use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::connect_id::ConnectId;
use crate::packet::CHUNK_SIZE;

/// Upper bound for buffered out-of-order chunks per link. A peer that opens
/// a gap this wide is either flooding or broken; exceeding the bound is
/// fatal for the connection.
pub const MAX_CHUNK_AMOUNT: usize = 5000;

/// How long the write loop parks when there is nothing to deliver before
/// re-checking its state.
pub const WRITE_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Callbacks from an outbound link into the trunk that hosts it.
///
/// The trunk owns the link through its registry; the link only ever talks
/// back through this object, so the two do not form an ownership cycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkHost: Send + Sync + 'static {
    /// Bytes read from the link's TCP socket, to be forwarded over the
    /// trunk. Returns false when the connection is not registered (any
    /// longer); the data is discarded in that case.
    async fn forward_data(&self, id: ConnectId, data: &[u8]) -> bool;

    /// The link has shut down. Emitted at most once per link; the host must
    /// not call back into the link from here.
    async fn close_connect(&self, id: ConnectId);
}

enum LinkTarget {
    /// Already-connected socket handed in by the ingress accept loop.
    Socket(TcpStream),
    /// Egress dial target, resolved and connected in `run`.
    Address(String, u16),
}

struct WriteState {
    /// Received chunks that cannot be delivered yet because a predecessor is
    /// missing. Keys are always `>= next_write_chunk_id`.
    write_chunks: BTreeMap<u32, Vec<u8>>,
    /// The next chunk index the TCP socket is allowed to receive.
    next_write_chunk_id: u32,
    /// When set, chunks with `index >= stop_write_chunk_id` are discarded
    /// and the link closes once everything below has been written.
    stop_write_chunk_id: Option<u32>,
    /// Everything that will ever be written is in `network_write_buffer`;
    /// close once it drains.
    stop_after_all_write: bool,
    /// Abandon buffered data and stop writing now.
    stop_write_immediate: bool,
    /// Flat buffer handed to the socket. Only the write loop touches it.
    network_write_buffer: Vec<u8>,
}

impl WriteState {
    /// Moves the longest deliverable run of chunks into the flat write
    /// buffer, honouring the stop index.
    fn fill_network_buffer(&mut self) {
        if let Some(stop) = self.stop_write_chunk_id {
            if stop <= self.next_write_chunk_id {
                self.stop_after_all_write = true;
                self.write_chunks.clear();
                return;
            }
        }

        while let Some(entry) = self.write_chunks.first_entry() {
            debug_assert!(*entry.key() >= self.next_write_chunk_id);
            if *entry.key() != self.next_write_chunk_id {
                break;
            }

            let chunk = entry.remove();
            self.next_write_chunk_id += 1;
            self.network_write_buffer.extend_from_slice(&chunk);

            if let Some(stop) = self.stop_write_chunk_id {
                if stop <= self.next_write_chunk_id {
                    self.stop_after_all_write = true;
                    self.write_chunks.clear();
                    break;
                }
            }
        }
    }
}

enum WriteStep {
    Write(Vec<u8>),
    Park,
    Finish,
}

/// One outbound TCP connection, either accepted (ingress) or dialled
/// (egress). Reads feed the trunk via [`LinkHost::forward_data`] in chunks
/// of at most [`CHUNK_SIZE`] bytes; writes deliver trunk chunks to the
/// socket strictly in index order. When both directions have stopped, the
/// socket is closed and the host is notified exactly once.
pub struct OutLink {
    target: Mutex<Option<LinkTarget>>,
    write_state: Mutex<WriteState>,
    /// Wakes the write loop: a deliverable chunk arrived, or a stop was
    /// requested.
    write_wake: Notify,
    read_cancel: Notify,
    read_processing: AtomicBool,
    write_processing: AtomicBool,
    close_invoked: AtomicBool,
}

impl OutLink {
    pub fn from_socket(socket: TcpStream) -> Arc<OutLink> {
        Self::new(LinkTarget::Socket(socket))
    }

    pub fn from_address(host: impl Into<String>, port: u16) -> Arc<OutLink> {
        Self::new(LinkTarget::Address(host.into(), port))
    }

    fn new(target: LinkTarget) -> Arc<OutLink> {
        Arc::new(OutLink {
            target: Mutex::new(Some(target)),
            write_state: Mutex::new(WriteState {
                write_chunks: BTreeMap::new(),
                next_write_chunk_id: 0,
                stop_write_chunk_id: None,
                stop_after_all_write: false,
                stop_write_immediate: false,
                network_write_buffer: Vec::new(),
            }),
            write_wake: Notify::new(),
            read_cancel: Notify::new(),
            read_processing: AtomicBool::new(false),
            write_processing: AtomicBool::new(false),
            close_invoked: AtomicBool::new(false),
        })
    }

    /// Starts the link. Non-blocking: the accepted-socket form begins
    /// reading and writing immediately, the dial form first resolves the
    /// address and tries the results in order. A failed resolve or an
    /// exhausted endpoint list closes the link, which reaches the host as a
    /// regular [`LinkHost::close_connect`].
    pub fn run(self: &Arc<Self>, host: Arc<dyn LinkHost>, id: ConnectId) {
        let target = self.target.lock().unwrap().take();
        match target {
            Some(LinkTarget::Socket(socket)) => self.start_io(socket, host, id),
            Some(LinkTarget::Address(address, port)) => {
                let link = self.clone();
                tokio::spawn(async move {
                    link.connect_and_start(address, port, host, id).await;
                });
            }
            None => warn!(?id, "link started twice, ignoring"),
        }
    }

    async fn connect_and_start(
        self: Arc<Self>,
        address: String,
        port: u16,
        host: Arc<dyn LinkHost>,
        id: ConnectId,
    ) {
        debug!(?id, "resolving {}:{}", address, port);
        let resolved: Vec<_> = match tokio::net::lookup_host((address.as_str(), port)).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!(?id, "cannot resolve {}:{}: {}", address, port, e);
                Vec::new()
            }
        };

        for addr in resolved {
            trace!(?id, "trying to connect to {:?}", addr);
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    debug!(?id, "connected to {:?}", addr);
                    self.start_io(socket, host, id);
                    return;
                }
                Err(e) => warn!(?id, "connecting to {:?} failed: {}", addr, e),
            }
        }

        // nothing to connect to: close without ever having started
        self.check_ready_close(&host, id).await;
    }

    fn start_io(self: &Arc<Self>, socket: TcpStream, host: Arc<dyn LinkHost>, id: ConnectId) {
        let (read_half, write_half) = socket.into_split();

        self.read_processing.store(true, Ordering::SeqCst);
        self.write_processing.store(true, Ordering::SeqCst);

        let link = self.clone();
        let read_host = host.clone();
        tokio::spawn(async move {
            link.read_loop(read_half, read_host, id).await;
        });

        let link = self.clone();
        tokio::spawn(async move {
            link.write_loop(write_half, host, id).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        host: Arc<dyn LinkHost>,
        id: ConnectId,
    ) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!(?id, "TCP peer closed the connection");
                            break;
                        }
                        Ok(n) => {
                            if !host.forward_data(id, &buf[..n]).await {
                                trace!(?id, "trunk refused data, connection is gone");
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(?id, "TCP read error: {}", e);
                            break;
                        }
                    }
                }
                _ = self.read_cancel.notified() => break,
            }
        }

        self.read_processing.store(false, Ordering::SeqCst);
        self.cancel_read_write();
        self.check_ready_close(&host, id).await;
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        host: Arc<dyn LinkHost>,
        id: ConnectId,
    ) {
        loop {
            let step = {
                let mut state = self.write_state.lock().unwrap();
                if state.stop_write_immediate {
                    WriteStep::Finish
                } else {
                    state.fill_network_buffer();
                    if state.network_write_buffer.is_empty() {
                        if state.stop_after_all_write {
                            WriteStep::Finish
                        } else {
                            WriteStep::Park
                        }
                    } else {
                        WriteStep::Write(std::mem::take(&mut state.network_write_buffer))
                    }
                }
            };

            match step {
                WriteStep::Finish => break,
                WriteStep::Park => {
                    tokio::select! {
                        _ = self.write_wake.notified() => {}
                        _ = time::sleep(WRITE_IDLE_TIMEOUT) => {
                            trace!(?id, "write idle timeout, re-checking");
                        }
                    }
                }
                WriteStep::Write(mut buf) => {
                    match write_half.write(&buf).await {
                        Ok(0) => {
                            debug!(?id, "TCP write returned zero bytes, closing");
                            break;
                        }
                        Ok(n) => {
                            trace!(?id, "wrote {} of {} buffered bytes", n, buf.len());
                            if n < buf.len() {
                                let rest = buf.split_off(n);
                                let mut state = self.write_state.lock().unwrap();
                                // only this loop fills the flat buffer, so it
                                // is still empty here
                                debug_assert!(state.network_write_buffer.is_empty());
                                state.network_write_buffer = rest;
                            }
                        }
                        Err(e) => {
                            debug!(?id, "TCP write error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        // best effort: flush a FIN so a drain-close is visible to the peer
        let _ = write_half.shutdown().await;

        self.write_processing.store(false, Ordering::SeqCst);
        self.cancel_read_write();
        self.check_ready_close(&host, id).await;
    }

    /// Hands a chunk received from the trunk to the write machinery.
    /// Duplicates and stale indices are dropped without effect; a chunk at
    /// or past a committed stop index is a logic error and is dropped too.
    pub fn send_chunk(&self, index: u32, data: &[u8]) {
        let mut state = self.write_state.lock().unwrap();

        if index < state.next_write_chunk_id {
            trace!("chunk {} is stale (next is {}), dropping", index, state.next_write_chunk_id);
            return;
        }
        if let Some(stop) = state.stop_write_chunk_id {
            if index >= stop {
                debug_assert!(false, "chunk {} arrived at or past stop index {}", index, stop);
                warn!("chunk {} arrived at or past stop index {}, dropping", index, stop);
                return;
            }
        }
        if state.write_chunks.contains_key(&index) {
            trace!("chunk {} is a duplicate, dropping", index);
            return;
        }
        if state.write_chunks.len() >= MAX_CHUNK_AMOUNT {
            error!(
                "more than {} chunks buffered, tearing the connection down",
                MAX_CHUNK_AMOUNT
            );
            state.stop_write_immediate = true;
            drop(state);
            self.write_wake.notify_one();
            self.read_cancel.notify_one();
            return;
        }

        state.write_chunks.insert(index, data.to_vec());

        if index == state.next_write_chunk_id {
            drop(state);
            self.write_wake.notify_one();
        }
    }

    /// Requests shutdown after everything with `index < stop_chunk` has been
    /// delivered. Chunks at or past the boundary are discarded; `stop(0)`
    /// stops as soon as the already-filled write buffer drains.
    pub fn stop(&self, stop_chunk: u32) {
        let mut state = self.write_state.lock().unwrap();

        if stop_chunk <= state.next_write_chunk_id {
            // everything requested is already out, close with what we have
            debug!("link stop: nothing left to deliver");
            state.stop_write_chunk_id = Some(state.next_write_chunk_id);
            state.stop_after_all_write = true;
            state.write_chunks.clear();
            drop(state);
            self.write_wake.notify_one();
            return;
        }

        debug!("link stop: draining up to chunk {}", stop_chunk);
        state.stop_write_chunk_id = Some(stop_chunk);
        state.write_chunks.retain(|&index, _| index < stop_chunk);
    }

    /// Drain-close without an explicit boundary: delivers the contiguous run
    /// of chunks that is already buffered, then closes. Used when the peer
    /// releases the connection, since nothing further will arrive.
    pub fn stop_after_pending(&self) {
        let stop_chunk = {
            let state = self.write_state.lock().unwrap();
            let mut next = state.next_write_chunk_id;
            while state.write_chunks.contains_key(&next) {
                next += 1;
            }
            next
        };
        self.stop(stop_chunk);
    }

    /// Stops both directions without draining. All pending socket operations
    /// observe the cancellation and the loops converge on the close path.
    pub fn cancel_read_write(&self) {
        {
            let mut state = self.write_state.lock().unwrap();
            state.stop_write_immediate = true;
        }
        self.write_wake.notify_one();
        self.read_cancel.notify_one();
    }

    async fn check_ready_close(&self, host: &Arc<dyn LinkHost>, id: ConnectId) {
        if self.read_processing.load(Ordering::SeqCst)
            || self.write_processing.load(Ordering::SeqCst)
        {
            return;
        }
        if !self.close_invoked.swap(true, Ordering::SeqCst) {
            debug!(?id, "link finished, notifying host");
            host.close_connect(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;

    fn test_id() -> ConnectId {
        ConnectId::from_bytes([7; 16])
    }

    /// TCP socket pair over loopback: the link side and the peer side.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, link_side) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap().0 });
        (link_side, peer.unwrap())
    }

    fn quiet_host() -> Arc<MockLinkHost> {
        let mut host = MockLinkHost::new();
        host.expect_forward_data().returning(|_, _| true);
        host.expect_close_connect().returning(|_| ());
        Arc::new(host)
    }

    async fn read_exact(peer: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .expect("timed out reading from peer")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_chunks_are_delivered_in_index_order() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);
        link.run(quiet_host() as Arc<dyn LinkHost>, test_id());

        link.send_chunk(2, b"C");
        link.send_chunk(0, b"A");
        link.send_chunk(1, b"B");

        assert_eq!(read_exact(&mut peer, 3).await, b"ABC");
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_chunks_are_dropped() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);
        link.run(quiet_host() as Arc<dyn LinkHost>, test_id());

        link.send_chunk(0, b"A");
        link.send_chunk(0, b"X");
        assert_eq!(read_exact(&mut peer, 1).await, b"A");

        // index 0 is now below the write cursor
        link.send_chunk(0, b"Y");
        link.send_chunk(1, b"B");
        assert_eq!(read_exact(&mut peer, 1).await, b"B");

        let mut probe = [0u8; 1];
        let res = time::timeout(Duration::from_millis(200), peer.read(&mut probe)).await;
        assert!(res.is_err(), "no further bytes may arrive");
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_chunks_then_closes() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockLinkHost::new();
        host.expect_forward_data().returning(|_, _| true);
        host.expect_close_connect()
            .times(1)
            .returning(move |_| {
                tx.send(()).unwrap();
            });
        link.run(Arc::new(host) as Arc<dyn LinkHost>, test_id());

        link.send_chunk(1, b"B");
        link.send_chunk(0, b"A");
        link.stop(2);

        assert_eq!(read_exact(&mut peer, 2).await, b"AB");
        let mut probe = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), peer.read(&mut probe))
            .await
            .expect("timed out waiting for EOF")
            .unwrap();
        assert_eq!(n, 0, "peer must observe EOF after the drain");

        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("close_connect was not invoked");
    }

    #[tokio::test]
    async fn test_stop_discards_chunks_past_the_boundary() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);
        link.run(quiet_host() as Arc<dyn LinkHost>, test_id());

        link.send_chunk(0, b"A");
        link.send_chunk(1, b"B");
        link.send_chunk(2, b"C");
        link.stop(1);

        assert_eq!(read_exact(&mut peer, 1).await, b"A");
        let mut probe = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), peer.read(&mut probe))
            .await
            .expect("timed out waiting for EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_stop_after_pending_delivers_the_contiguous_run() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);
        link.run(quiet_host() as Arc<dyn LinkHost>, test_id());

        link.send_chunk(0, b"A");
        link.send_chunk(1, b"B");
        // chunk 3 is beyond the gap at 2 and can never be delivered
        link.send_chunk(3, b"D");
        link.stop_after_pending();

        assert_eq!(read_exact(&mut peer, 2).await, b"AB");
        let mut probe = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), peer.read(&mut probe))
            .await
            .expect("timed out waiting for EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tcp_reads_are_forwarded_into_the_trunk() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockLinkHost::new();
        host.expect_forward_data()
            .withf(|id, data| *id == ConnectId::from_bytes([7; 16]) && data == b"hello")
            .returning(move |_, _| {
                tx.send(()).unwrap();
                true
            });
        host.expect_close_connect().returning(|_| ());
        link.run(Arc::new(host) as Arc<dyn LinkHost>, test_id());

        peer.write_all(b"hello").await.unwrap();

        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("data was not forwarded");
    }

    #[tokio::test]
    async fn test_peer_eof_closes_the_link_exactly_once() {
        let (link_side, peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockLinkHost::new();
        host.expect_forward_data().returning(|_, _| true);
        host.expect_close_connect()
            .times(1)
            .returning(move |_| {
                tx.send(()).unwrap();
            });
        link.run(Arc::new(host) as Arc<dyn LinkHost>, test_id());

        drop(peer);

        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("close_connect was not invoked");

        // converged loops must not produce a second notification
        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_closes_without_draining() {
        let (link_side, mut peer) = socket_pair().await;
        let link = OutLink::from_socket(link_side);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockLinkHost::new();
        host.expect_forward_data().returning(|_, _| true);
        host.expect_close_connect()
            .times(1)
            .returning(move |_| {
                tx.send(()).unwrap();
            });
        link.run(Arc::new(host) as Arc<dyn LinkHost>, test_id());

        // park the writer, then cancel; the buffered gap chunk is abandoned
        link.send_chunk(5, b"Z");
        link.cancel_read_write();

        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("close_connect was not invoked");

        let mut probe = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), peer.read(&mut probe))
            .await
            .expect("timed out waiting for EOF")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unreachable_dial_target_reports_close() {
        // bind and drop to get a port that very likely refuses connections
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let link = OutLink::from_address("127.0.0.1", dead_port);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = MockLinkHost::new();
        host.expect_close_connect()
            .times(1)
            .returning(move |_| {
                tx.send(()).unwrap();
            });
        link.run(Arc::new(host) as Arc<dyn LinkHost>, test_id());

        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("close_connect was not invoked");
    }
}
