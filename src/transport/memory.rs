//! In-memory channel for tests and offline runs.
//!
//! A `MemoryLink` is the far end of the channel: it scripts inbound events and
//! records every frame the client sends. Cloned links share the same state.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::{anyhow, Result};

use super::channel::{ChannelEvent, Connector, DuplexChannel};
use super::protocol::ConnectParams;

#[derive(Default)]
struct LinkState {
    open: bool,
    inbound: VecDeque<ChannelEvent>,
    sent: Vec<String>,
    connects: Vec<ConnectParams>,
    closes: u32,
    refuse_next: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryLink {
    state: Rc<RefCell<LinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { link: self.clone() }
    }

    /// Queue a text reply for the client.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.push_event(ChannelEvent::Message(text.into()));
    }

    pub fn push_event(&self, event: ChannelEvent) {
        self.state.borrow_mut().inbound.push_back(event);
    }

    /// Make the next `connect` fail with `reason`.
    pub fn refuse_next_connect(&self, reason: impl Into<String>) {
        self.state.borrow_mut().refuse_next = Some(reason.into());
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.borrow().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.borrow().sent.len()
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.state.borrow().connects.clone()
    }

    pub fn close_count(&self) -> u32 {
        self.state.borrow().closes
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }
}

pub struct MemoryConnector {
    link: MemoryLink,
}

impl Connector for MemoryConnector {
    fn connect(&mut self, params: &ConnectParams) -> Result<Box<dyn DuplexChannel>> {
        let mut state = self.link.state.borrow_mut();
        if let Some(reason) = state.refuse_next.take() {
            return Err(anyhow!("connection refused: {}", reason));
        }
        state.connects.push(params.clone());
        state.open = true;
        state.inbound.push_front(ChannelEvent::Opened);
        Ok(Box::new(MemoryChannel {
            link: self.link.clone(),
        }))
    }
}

pub struct MemoryChannel {
    link: MemoryLink,
}

impl DuplexChannel for MemoryChannel {
    fn send_text(&mut self, text: String) -> Result<()> {
        let mut state = self.link.state.borrow_mut();
        if !state.open {
            return Err(anyhow!("channel is closed"));
        }
        state.sent.push(text);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<ChannelEvent> {
        let mut state = self.link.state.borrow_mut();
        if !state.open {
            return None;
        }
        let event = state.inbound.pop_front()?;
        if matches!(event, ChannelEvent::Closed(_) | ChannelEvent::Error(_)) {
            state.open = false;
        }
        Some(event)
    }

    fn close(&mut self) {
        let mut state = self.link.state.borrow_mut();
        if state.open {
            state.open = false;
            state.closes += 1;
            state.inbound.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.link.state.borrow().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn params() -> ConnectParams {
        ConnectParams {
            endpoint: Url::parse("ws://localhost/ws").unwrap(),
            confidence: 0.5,
            model: "yolo".to_string(),
            roi: None,
            token: None,
        }
    }

    #[test]
    fn channel_opens_then_delivers_replies_in_order() {
        let link = MemoryLink::new();
        let mut channel = link.connector().connect(&params()).unwrap();
        link.push_reply("a");
        link.push_reply("b");
        assert_eq!(channel.poll_event(), Some(ChannelEvent::Opened));
        assert_eq!(channel.poll_event(), Some(ChannelEvent::Message("a".into())));
        assert_eq!(channel.poll_event(), Some(ChannelEvent::Message("b".into())));
        assert_eq!(channel.poll_event(), None);
    }

    #[test]
    fn close_counts_once_and_blocks_sends() {
        let link = MemoryLink::new();
        let mut channel = link.connector().connect(&params()).unwrap();
        channel.close();
        channel.close();
        assert_eq!(link.close_count(), 1);
        assert!(channel.send_text("x".into()).is_err());
    }

    #[test]
    fn refused_connect_fails_once() {
        let link = MemoryLink::new();
        link.refuse_next_connect("offline");
        assert!(link.connector().connect(&params()).is_err());
        assert!(link.connector().connect(&params()).is_ok());
        assert_eq!(link.connects().len(), 1);
    }
}
