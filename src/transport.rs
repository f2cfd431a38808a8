//! NetworkAL: frame-level UDP send/receive and liveness detection.
//!
//! Two sockets are involved: one connected to the device for sending,
//! one bound locally for reading. A dedicated thread blocks on
//! `recv_from` with a 5-second timeout; silence for that long is the
//! sole liveness signal and triggers [`DatagramListener::on_disconnect`].

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::wire::{self, DataType};

/// The duration of silence after which the read loop declares disconnect.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives frame-level events from a [`Transport`].
///
/// Implementations must be cheap and non-blocking: they run directly on
/// the transport's read thread.
pub trait DatagramListener: Send + Sync {
    fn on_data(&self, data_type: DataType, buffer: u8, seq: u8, payload: &[u8]);
    fn on_disconnect(&self);
}

/// Owns the send/recv UDP sockets and the background read thread.
pub struct Transport {
    send_sock: UdpSocket,
    alive: Arc<AtomicBool>,
    read_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Opens the send socket (connected to `ip:remote_port`) and the recv
    /// socket (bound to `0.0.0.0:local_port`), then spawns the read loop.
    pub fn new(
        ip: std::net::IpAddr,
        remote_port: u16,
        local_port: u16,
        listener: Arc<dyn DatagramListener>,
    ) -> io::Result<Self> {
        let send_sock = UdpSocket::bind(("0.0.0.0", 0))?;
        send_sock.connect(SocketAddr::new(ip, remote_port))?;

        let recv_sock = UdpSocket::bind(("0.0.0.0", local_port))?;
        recv_sock.set_read_timeout(Some(READ_TIMEOUT))?;

        let alive = Arc::new(AtomicBool::new(true));

        tracing::debug!(%ip, %remote_port, %local_port, "Opened NetworkAL sockets");

        let read_thread = {
            let alive = alive.clone();
            std::thread::Builder::new()
                .name("arsdk-netal-read".to_owned())
                .spawn(move || read_loop(recv_sock, alive, listener))
                .map_err(|e| io::Error::other(format!("failed to spawn read thread: {e}")))?
        };

        Ok(Self {
            send_sock,
            alive,
            read_thread: Mutex::new(Some(read_thread)),
        })
    }

    /// Builds a frame and performs one `sendto`. Never retries; the return
    /// value indicates only whether the syscall itself succeeded.
    pub fn send(&self, data_type: DataType, buffer: u8, seq: u8, payload: &[u8]) -> bool {
        let frame = wire::Frame {
            data_type,
            buffer_id: buffer,
            seq,
            payload,
        };
        let bytes = frame.encode();

        match self.send_sock.send(&bytes) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, %buffer, %seq, "UDP send failed");
                false
            }
        }
    }

    /// Idempotent. Causes the read loop to exit and disconnects both
    /// sockets; `on_disconnect` still fires exactly once from the read
    /// thread itself once it observes the flag or a socket error.
    pub fn stop(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        // Shutting down the send socket is enough to make further sends
        // fail; the recv socket unblocks naturally via its read timeout.
        if let Err(e) = self.send_sock.shutdown(std::net::Shutdown::Both) {
            tracing::debug!(error = %e, "Error shutting down send socket (already closed?)");
        }

        if let Some(handle) = self.read_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(sock: UdpSocket, alive: Arc<AtomicBool>, listener: Arc<dyn DatagramListener>) {
    let mut buf = vec![0u8; 66_000];

    while alive.load(Ordering::SeqCst) {
        let len = match sock.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                tracing::warn!("No data received within {READ_TIMEOUT:?}, declaring disconnect");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Read loop socket error, declaring disconnect");
                break;
            }
        };

        if let Err(e) = wire::for_each_frame(&buf[..len], |frame| {
            tracing::trace!(
                target: "wire::net::recv",
                data_type = %frame.data_type,
                buffer = frame.buffer_id,
                seq = frame.seq,
                len = frame.payload.len(),
            );
            listener.on_data(frame.data_type, frame.buffer_id, frame.seq, frame.payload);
        }) {
            tracing::warn!(error = %e, "Dropping malformed datagram");
        }
    }

    alive.store(false, Ordering::SeqCst);
    listener.on_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        received: Mutex<Vec<(u8, u8, Vec<u8>)>>,
        disconnected: Mutex<u32>,
    }

    impl DatagramListener for RecordingListener {
        fn on_data(&self, _data_type: DataType, buffer: u8, seq: u8, payload: &[u8]) {
            self.received
                .lock()
                .unwrap()
                .push((buffer, seq, payload.to_vec()));
        }

        fn on_disconnect(&self) {
            *self.disconnected.lock().unwrap() += 1;
        }
    }

    #[test]
    fn send_to_loopback_is_received() {
        let listener = Arc::new(RecordingListener::default());

        let recv_port = {
            let probe = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
            probe.local_addr().unwrap().port()
        };

        let transport = Transport::new(
            "127.0.0.1".parse().unwrap(),
            recv_port,
            recv_port + 1,
            listener.clone(),
        )
        .unwrap();

        // Send from a throwaway peer socket directly into our recv port,
        // exercising the wire encoding/read-loop path end to end.
        let peer = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        peer.connect(("127.0.0.1", recv_port)).unwrap();

        let frame = wire::Frame {
            data_type: DataType::Data,
            buffer_id: 126,
            seq: 3,
            payload: b"hi",
        };
        peer.send(&frame.encode()).unwrap();

        for _ in 0..200 {
            if !listener.received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(
            listener.received.lock().unwrap().as_slice(),
            &[(126, 3, b"hi".to_vec())]
        );

        transport.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let listener = Arc::new(RecordingListener::default());
        let recv_port = {
            let probe = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
            probe.local_addr().unwrap().port()
        };
        let transport =
            Transport::new("127.0.0.1".parse().unwrap(), recv_port, recv_port + 2, listener)
                .unwrap();

        transport.stop();
        transport.stop();
    }
}
