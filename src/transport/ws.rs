//! WebSocket channel to the realtime detection endpoint.
//!
//! `connect` only establishes the TCP connection. The socket is non-blocking
//! from then on: the HTTP upgrade is driven one step per `poll_event`, and
//! `ChannelEvent::Opened` is emitted when it completes. A handshake that has
//! not finished within `connect_timeout` fails the channel.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tungstenite::handshake::MidHandshake;
use tungstenite::{ClientHandshake, HandshakeError, Message, WebSocket};

use super::channel::{ChannelEvent, Connector, DuplexChannel};
use super::protocol::ConnectParams;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct WsConnector {
    /// Bound on the TCP connect and, separately, on the upgrade handshake.
    pub connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Connector for WsConnector {
    fn connect(&mut self, params: &ConnectParams) -> Result<Box<dyn DuplexChannel>> {
        let url = params.url();
        if url.scheme() != "ws" {
            return Err(anyhow!(
                "unsupported endpoint scheme '{}' (expected ws://)",
                url.scheme()
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("endpoint has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow!("{}:{} did not resolve", host, port))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("connect to {}", addr))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        stream
            .set_nonblocking(true)
            .context("switch socket to non-blocking")?;

        let deadline = Instant::now() + self.connect_timeout;
        let mut channel = WsChannel {
            peer: addr,
            link: None,
            pending: VecDeque::new(),
        };
        match tungstenite::client(url.as_str(), stream) {
            Ok((socket, _response)) => {
                log::info!("WsChannel: connected to {}{}", addr, url.path());
                channel.link = Some(Link::Open(socket));
                channel.pending.push_back(ChannelEvent::Opened);
            }
            Err(HandshakeError::Interrupted(mid)) => {
                log::debug!("WsChannel: upgrading {}{}", addr, url.path());
                channel.link = Some(Link::Handshaking { mid, deadline });
            }
            Err(HandshakeError::Failure(e)) => {
                return Err(anyhow!("websocket handshake with {} failed: {}", addr, e));
            }
        }
        Ok(Box::new(channel))
    }
}

enum Link {
    Handshaking {
        mid: MidHandshake<ClientHandshake<TcpStream>>,
        deadline: Instant,
    },
    Open(WebSocket<TcpStream>),
}

pub struct WsChannel {
    peer: SocketAddr,
    link: Option<Link>,
    pending: VecDeque<ChannelEvent>,
}

impl WsChannel {
    fn continue_handshake(&mut self) -> Option<ChannelEvent> {
        let Some(Link::Handshaking { mid, deadline }) = self.link.take() else {
            return None;
        };
        match mid.handshake() {
            Ok((socket, _response)) => {
                log::info!("WsChannel: connected to {}", self.peer);
                self.link = Some(Link::Open(socket));
                Some(ChannelEvent::Opened)
            }
            Err(HandshakeError::Interrupted(mid)) => {
                if Instant::now() >= deadline {
                    log::warn!("WsChannel: no upgrade response from {}", self.peer);
                    return Some(ChannelEvent::Error(format!(
                        "websocket handshake with {} timed out",
                        self.peer
                    )));
                }
                self.link = Some(Link::Handshaking { mid, deadline });
                None
            }
            Err(HandshakeError::Failure(e)) => Some(ChannelEvent::Error(format!(
                "websocket handshake with {} failed: {}",
                self.peer, e
            ))),
        }
    }
}

impl DuplexChannel for WsChannel {
    fn send_text(&mut self, text: String) -> Result<()> {
        let socket = match self.link.as_mut() {
            Some(Link::Open(socket)) => socket,
            Some(Link::Handshaking { .. }) => return Err(anyhow!("channel is not open yet")),
            None => return Err(anyhow!("channel is closed")),
        };
        match socket.send(Message::Text(text.into())) {
            Ok(()) => Ok(()),
            // Queued in the write buffer; flushed by the next read.
            Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(anyhow!("websocket send failed: {}", e)),
        }
    }

    fn poll_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if matches!(self.link, Some(Link::Handshaking { .. })) {
            return self.continue_handshake();
        }
        let Some(Link::Open(socket)) = self.link.as_mut() else {
            return None;
        };
        match socket.read() {
            Ok(Message::Text(text)) => Some(ChannelEvent::Message(text.to_string())),
            Ok(Message::Close(frame)) => {
                self.link = None;
                Some(ChannelEvent::Closed(
                    frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                ))
            }
            Ok(_) => None,
            Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                self.link = None;
                Some(ChannelEvent::Closed(None))
            }
            Err(e) => {
                self.link = None;
                Some(ChannelEvent::Error(e.to_string()))
            }
        }
    }

    fn close(&mut self) {
        self.pending.clear();
        match self.link.take() {
            Some(Link::Open(mut socket)) => {
                if let Err(e) = socket.close(None) {
                    log::debug!("WsChannel: close handshake failed: {}", e);
                }
                let _ = socket.flush();
                log::info!("WsChannel: closed");
            }
            Some(Link::Handshaking { .. }) => {
                log::info!("WsChannel: abandoned upgrade with {}", self.peer);
            }
            None => {}
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;
    use url::Url;

    fn params(addr: SocketAddr) -> ConnectParams {
        ConnectParams {
            endpoint: Url::parse(&format!("ws://{}/api/v1/ws/realtime-detect", addr)).unwrap(),
            confidence: 0.5,
            model: "yolo".to_string(),
            roi: None,
            token: None,
        }
    }

    /// Polls until an event arrives or `limit` passes.
    fn wait_event(channel: &mut dyn DuplexChannel, limit: Duration) -> Option<ChannelEvent> {
        let until = Instant::now() + limit;
        while Instant::now() < until {
            if let Some(event) = channel.poll_event() {
                return Some(event);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn silent_server_does_not_block_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            // accept and never answer the upgrade
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        let mut connector = WsConnector {
            connect_timeout: Duration::from_millis(300),
        };
        let started = Instant::now();
        let mut channel = connector.connect(&params(addr)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(channel.is_open());
        assert!(channel.poll_event().is_none());
        assert!(channel.send_text("{}".to_string()).is_err());

        match wait_event(channel.as_mut(), Duration::from_secs(3)) {
            Some(ChannelEvent::Error(reason)) => assert!(reason.contains("timed out"), "{}", reason),
            other => panic!("expected handshake timeout, got {:?}", other),
        }
        assert!(!channel.is_open());
        server.join().unwrap();
    }

    #[test]
    fn upgrade_completes_across_polls_and_carries_text() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ws = tungstenite::accept(stream).unwrap();
            ws.send(Message::Text("hello".into())).unwrap();
            match ws.read().unwrap() {
                Message::Text(text) => text.to_string(),
                other => panic!("unexpected message {:?}", other),
            }
        });

        let mut channel = WsConnector::default().connect(&params(addr)).unwrap();
        assert_eq!(
            wait_event(channel.as_mut(), Duration::from_secs(3)),
            Some(ChannelEvent::Opened)
        );
        assert_eq!(
            wait_event(channel.as_mut(), Duration::from_secs(3)),
            Some(ChannelEvent::Message("hello".to_string()))
        );
        channel.send_text("frame".to_string()).unwrap();

        let until = Instant::now() + Duration::from_secs(3);
        while !server.is_finished() && Instant::now() < until {
            channel.poll_event();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.join().unwrap(), "frame");
        channel.close();
        assert!(!channel.is_open());
    }
}
