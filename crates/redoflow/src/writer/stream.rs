//! TCP stream sink: length-prefixed frames, one consumer at a time.
//!
//! The listener stays non-blocking; a disconnect surfaces as a network
//! error so the writer flips back to the accept loop without touching the
//! pipeline. A small synchronous client lives here too, for consumers and
//! the test-suite.

use super::sink::{ClientRequest, ServerResponse, Sink};
use crate::builder::OutputMessage;
use crate::error::{RedoError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

const MAX_CONTROL_FRAME: usize = 64 * 1024;
const WRITE_RETRY_SLEEP: Duration = Duration::from_millis(1);
const WRITE_RETRY_MAX: u32 = 10_000;

pub struct StreamSink {
    listener: TcpListener,
    client: Option<TcpStream>,
    read_buf: Vec<u8>,
}

impl StreamSink {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| RedoError::config(10020, format!("cannot bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| RedoError::config(10020, format!("cannot configure {addr}: {e}")))?;
        tracing::info!(addr, "stream sink listening");
        Ok(StreamSink { listener, client: None, read_buf: Vec::new() })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn disconnect(&mut self, why: &str) -> RedoError {
        self.client = None;
        self.read_buf.clear();
        tracing::warn!(code = 20003u32, "consumer disconnected: {why}");
        RedoError::network(20003, format!("consumer disconnected: {why}"))
    }

    fn try_accept(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_err() {
                    return;
                }
                let _ = stream.set_nodelay(true);
                tracing::info!(%peer, "consumer connected");
                self.read_buf.clear();
                self.client = Some(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!(code = 20004u32, error = %e, "accept failed");
            }
        }
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        // Take the stream so a failure path can drop it cleanly.
        let Some(mut client) = self.client.take() else {
            return Err(RedoError::network(20005, "no consumer attached"));
        };
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(bytes);

        let mut written = 0usize;
        let mut retries = 0u32;
        while written < frame.len() {
            match client.write(&frame[written..]) {
                Ok(0) => return Err(self.disconnect("write returned zero")),
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > WRITE_RETRY_MAX {
                        return Err(self.disconnect("write stalled"));
                    }
                    std::thread::sleep(WRITE_RETRY_SLEEP);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let msg = e.to_string();
                    return Err(self.disconnect(&msg));
                }
            }
        }
        self.client = Some(client);
        Ok(())
    }
}

impl Sink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn poll(&mut self) -> Result<Option<ClientRequest>> {
        if self.client.is_none() {
            self.try_accept();
            if self.client.is_none() {
                return Ok(None);
            }
        }

        // Pull whatever is available into the frame buffer.
        let mut chunk = [0u8; 4096];
        loop {
            let client = self.client.as_mut().expect("client attached above");
            match client.read(&mut chunk) {
                Ok(0) => return Err(self.disconnect("end of stream")),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if self.read_buf.len() > MAX_CONTROL_FRAME + 4 {
                        return Err(self.disconnect("oversized control frame"));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let msg = e.to_string();
                    return Err(self.disconnect(&msg));
                }
            }
        }

        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.read_buf[0..4].try_into().expect("4 bytes")) as usize;
        if len > MAX_CONTROL_FRAME {
            return Err(self.disconnect("oversized control frame"));
        }
        if self.read_buf.len() < 4 + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.read_buf[4..4 + len].to_vec();
        self.read_buf.drain(..4 + len);
        ClientRequest::decode(&body).map(Some)
    }

    fn send(&mut self, msg: &OutputMessage) -> Result<()> {
        self.write_frame(&msg.data)?;
        metrics::counter!("redoflow_writer_messages_sent_total").increment(1);
        metrics::counter!("redoflow_writer_bytes_sent_total").increment(msg.data.len() as u64);
        Ok(())
    }

    fn respond(&mut self, resp: &ServerResponse) -> Result<()> {
        self.write_frame(&resp.encode())
    }

    fn connected(&self) -> bool {
        self.client.is_some()
    }
}

/// Blocking consumer-side counterpart; used by downstream tooling and the
/// integration tests.
pub struct StreamClient {
    stream: TcpStream,
}

impl StreamClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| RedoError::network(20006, format!("cannot connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(StreamClient { stream })
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    pub fn request(&mut self, req: &ClientRequest) -> Result<()> {
        let body = req.encode();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Read one raw frame (a message or an encoded response).
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn read_response(&mut self) -> Result<ServerResponse> {
        let body = self.read_frame()?;
        ServerResponse::decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scn;

    #[test]
    fn accept_request_respond_cycle() {
        let mut sink = StreamSink::bind("127.0.0.1:0").unwrap();
        let addr = sink.local_addr().unwrap().to_string();
        assert!(!sink.connected());
        assert!(sink.poll().unwrap().is_none());

        let mut client = StreamClient::connect(&addr).unwrap();
        client.set_timeout(Duration::from_secs(5)).unwrap();
        client.request(&ClientRequest::Info).unwrap();

        // Accept plus request may take a few polls.
        let mut request = None;
        for _ in 0..100 {
            if let Some(req) = sink.poll().unwrap() {
                request = Some(req);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(request, Some(ClientRequest::Info));
        assert!(sink.connected());

        let resp = ServerResponse::Ready { first_data_scn: Scn(100), c_scn: Scn::NONE, c_idx: 0 };
        sink.respond(&resp).unwrap();
        assert_eq!(client.read_response().unwrap(), resp);
    }

    #[test]
    fn disconnect_is_a_network_error() {
        let mut sink = StreamSink::bind("127.0.0.1:0").unwrap();
        let addr = sink.local_addr().unwrap().to_string();
        {
            let _client = StreamClient::connect(&addr).unwrap();
            // Wait until accepted.
            for _ in 0..100 {
                let _ = sink.poll();
                if sink.connected() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(sink.connected());
        }
        // Client dropped; the next polls observe the close.
        let mut saw_error = false;
        for _ in 0..100 {
            match sink.poll() {
                Err(e) => {
                    assert_eq!(e.category(), crate::error::ErrorCategory::Network);
                    saw_error = true;
                    break;
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(saw_error);
        assert!(!sink.connected());
    }

    #[test]
    fn message_frames_reach_the_client() {
        let mut sink = StreamSink::bind("127.0.0.1:0").unwrap();
        let addr = sink.local_addr().unwrap().to_string();
        let mut client = StreamClient::connect(&addr).unwrap();
        client.set_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..100 {
            let _ = sink.poll();
            if sink.connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let msg = OutputMessage {
            id: 1,
            scn: Scn(100),
            idx: 0,
            flags: 0,
            tag_len: 0,
            data: b"{\"hello\":1}".to_vec(),
        };
        sink.send(&msg).unwrap();
        assert_eq!(client.read_frame().unwrap(), msg.data);
    }
}
