#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use fkv_common::{decode_frame, decode_length, encode_frame, FRAME_HEADER_LEN};

/// Fake store: accepts connections forever and runs `handler` on its own
/// thread for each one, passing the zero-based connection index.
pub struct FakeServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(usize, TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let counter = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                thread::spawn(move || handler(index, stream));
            }
        });

        FakeServer { addr, accepted }
    }

    /// Echoes every frame back to the sender.
    pub fn echo() -> Self {
        Self::spawn(|_, stream| serve_echo(stream))
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Echo loop built on the incremental frame decoder.
pub fn serve_echo(mut stream: TcpStream) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut chunk = [0u8; 4096];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(read) => read,
        };
        buffer.extend_from_slice(&chunk[..read]);
        while let Some(payload) = decode_frame(&mut buffer) {
            if write_frame(&mut stream, &payload).is_err() {
                return;
            }
        }
    }
}

pub fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; decode_length(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let mut frame = BytesMut::new();
    encode_frame(payload, &mut frame).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    stream.write_all(&frame)?;
    stream.flush()
}

/// Blocks until the peer closes the socket, without answering.
pub fn hold_open(mut stream: TcpStream) {
    let _ = stream.set_read_timeout(None);
    let mut sink = [0u8; 1024];
    while let Ok(read) = stream.read(&mut sink) {
        if read == 0 {
            return;
        }
    }
}

/// An address with nothing listening on it.
pub fn closed_endpoint() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr")
}
