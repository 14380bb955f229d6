//! Mock IPMI transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{ChannelKind, IpmiRequest, IpmiResponse, IpmiTransport, TransportError};
use crate::protocol::constants::DEFAULT_MAX_REQUEST_SIZE;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(IpmiResponse),
    NoResponse,
}

type Responder = Box<dyn FnMut(&IpmiRequest) -> MockReply + Send>;

/// Mock transport for unit testing the upgrade engine.
///
/// Replies come from the scripted queue first, then from the optional
/// responder; with neither, the target is silent. Clones share state, so a
/// test can keep a handle to inspect captured requests.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies returned in order.
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Fallback used once the queue is empty.
    responder: Arc<Mutex<Option<Responder>>>,
    /// Captured requests.
    request_log: Arc<Mutex<Vec<IpmiRequest>>>,
    reopens: Arc<Mutex<u32>>,
    /// Whether the channel is "open".
    connected: Arc<Mutex<bool>>,
    kind: ChannelKind,
    max_request: usize,
    direct: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            responder: Arc::new(Mutex::new(None)),
            request_log: Arc::new(Mutex::new(Vec::new())),
            reopens: Arc::new(Mutex::new(0)),
            connected: Arc::new(Mutex::new(true)),
            kind: ChannelKind::Local,
            max_request: DEFAULT_MAX_REQUEST_SIZE,
            direct: true,
        }
    }

    /// Mock a LAN-family channel.
    pub fn lan() -> Self {
        Self {
            kind: ChannelKind::Lan,
            ..Self::new()
        }
    }

    pub fn set_max_request_size(&mut self, size: usize) {
        self.max_request = size;
    }

    pub fn set_directly_attached(&mut self, direct: bool) {
        self.direct = direct;
    }

    /// Queue a response with data.
    pub fn queue_response(&self, ccode: u8, data: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Response(IpmiResponse::new(ccode, data.to_vec())));
    }

    /// Queue a response carrying only a completion code.
    pub fn queue_code(&self, ccode: u8) {
        self.queue_response(ccode, &[]);
    }

    /// Queue a silent target.
    pub fn queue_no_response(&self) {
        self.replies.lock().unwrap().push_back(MockReply::NoResponse);
    }

    /// Install a responder consulted once the queue is empty.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&IpmiRequest) -> MockReply + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Get all captured requests.
    pub fn requests(&self) -> Vec<IpmiRequest> {
        self.request_log.lock().unwrap().clone()
    }

    /// Captured requests for one command.
    pub fn requests_for(&self, cmd: u8) -> Vec<IpmiRequest> {
        self.request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.cmd == cmd)
            .cloned()
            .collect()
    }

    /// Clear captured requests.
    pub fn clear_requests(&self) {
        self.request_log.lock().unwrap().clear();
    }

    pub fn reopen_count(&self) -> u32 {
        *self.reopens.lock().unwrap()
    }

    /// Simulate the channel going away.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl IpmiTransport for MockTransport {
    fn send_recv(&self, req: &IpmiRequest) -> Result<IpmiResponse, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Closed);
        }
        self.request_log.lock().unwrap().push(req.clone());

        let queued = self.replies.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => match self.responder.lock().unwrap().as_mut() {
                Some(responder) => responder(req),
                None => MockReply::NoResponse,
            },
        };

        match reply {
            MockReply::Response(rsp) => Ok(rsp),
            MockReply::NoResponse => Err(TransportError::NoResponse),
        }
    }

    fn channel_kind(&self) -> ChannelKind {
        self.kind
    }

    fn max_request_size(&self) -> usize {
        self.max_request
    }

    fn is_directly_attached(&self) -> bool {
        self.direct
    }

    fn reopen(&self) -> Result<(), TransportError> {
        *self.reopens.lock().unwrap() += 1;
        *self.connected.lock().unwrap() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_response(0x00, &[0x00, 0x01]);
        mock.queue_code(0xC0);

        let req = messages::get_upgrade_status();
        let r1 = mock.send_recv(&req).unwrap();
        assert!(r1.ccode.is_success());
        assert_eq!(r1.data, vec![0x00, 0x01]);

        let r2 = mock.send_recv(&req).unwrap();
        assert!(r2.ccode.is_node_busy());

        // Queue is empty now and no responder is installed
        assert!(matches!(
            mock.send_recv(&req),
            Err(TransportError::NoResponse)
        ));
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn test_mock_responder() {
        let mock = MockTransport::new();
        mock.set_responder(|req| MockReply::Response(IpmiResponse::code(req.cmd)));
        let rsp = mock.send_recv(&messages::abort_upgrade()).unwrap();
        assert_eq!(rsp.ccode.value(), 0x30);
    }

    #[test]
    fn test_mock_disconnect_reopen() {
        let mock = MockTransport::lan();
        assert_eq!(mock.channel_kind(), ChannelKind::Lan);
        mock.disconnect();
        assert!(mock.send_recv(&messages::abort_upgrade()).is_err());
        mock.reopen().unwrap();
        assert_eq!(mock.reopen_count(), 1);
        mock.queue_code(0x00);
        assert!(mock.send_recv(&messages::abort_upgrade()).is_ok());
    }
}
