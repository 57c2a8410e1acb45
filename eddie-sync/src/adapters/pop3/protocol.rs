//! POP3 request/response pipeline.
//!
//! `Pop3Protocol` does no I/O. Bytes to write accumulate in an outbox that the
//! connection task drains after every call; bytes read from the socket are fed
//! in through [`Pop3Protocol::on_receive`]. Responses are matched to requests
//! strictly in FIFO order.

use std::collections::VecDeque;
use std::fmt;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::parser::{Pop3Parser, Response};

/// Negative replies are delivered as `Err` so callers can `?` them.
pub type Reply = Result<Response, Response>;

/// A command waiting for its reply.
pub struct Request {
    /// `None` for the placeholder that captures the server greeting.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub expect_multiline: bool,
    responder: Option<oneshot::Sender<Reply>>,
}

impl Request {
    pub fn new(
        command: &str,
        args: Vec<String>,
        expect_multiline: bool,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command: Some(command.to_string()),
                args,
                expect_multiline,
                responder: Some(tx),
            },
            rx,
        )
    }

    /// Placeholder paired with the greeting the server sends on connect.
    pub fn greeting() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command: None,
                args: Vec::new(),
                expect_multiline: false,
                responder: Some(tx),
            },
            rx,
        )
    }

    /// Wire form: `COMMAND arg1 arg2\r\n`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut line = self.command.clone().unwrap_or_default();
        if !self.args.is_empty() {
            line.push(' ');
            line.push_str(&self.args.join(" "));
        }
        line.push_str("\r\n");
        line.into_bytes()
    }

    fn respond(mut self, mut response: Response) {
        response.request = Some(self.to_string());
        let reply = if response.ok { Ok(response) } else { Err(response) };
        if let Some(tx) = self.responder.take() {
            // The caller may have given up waiting.
            let _ = tx.send(reply);
        }
    }

    fn respond_with_error(self, description: &str) {
        self.respond(Response::error(description));
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(command) = &self.command else {
            return write!(f, "(greeting)");
        };
        match command.as_str() {
            // Never print credentials.
            "PASS" | "AUTH" | "APOP" => write!(f, "{} ***", command),
            _ if self.args.is_empty() => write!(f, "{}", command),
            _ => write!(f, "{} {}", command, self.args.join(" ")),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request", &self.to_string())
            .field("expect_multiline", &self.expect_multiline)
            .finish()
    }
}

/// Matches parsed responses to outstanding requests.
#[derive(Debug, Default)]
pub struct Pop3Protocol {
    parser: Pop3Parser,
    /// Sent, awaiting a response.
    pending: VecDeque<Request>,
    /// Parked because pipelining is off and something is outstanding.
    unsent: VecDeque<Request>,
    /// Encoded requests not yet written to the socket.
    outbox: Vec<Vec<u8>>,
    pub pipeline: bool,
    closed: bool,
}

impl Pop3Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipelining(pipeline: bool) -> Self {
        Self {
            pipeline,
            ..Self::default()
        }
    }

    /// Queue the greeting placeholder; nothing is written for it.
    pub fn expect_greeting(&mut self, request: Request) {
        self.pending.push_back(request);
    }

    /// Write the request now, or park it until the outstanding one is answered.
    pub fn send_request(&mut self, request: Request) {
        if self.closed {
            request.respond_with_error("(request sent after connection closed)");
            return;
        }

        if self.pipeline || self.pending.is_empty() {
            debug!("POP3 > {}", request);
            self.outbox.push(request.to_bytes());
            self.pending.push_back(request);
        } else {
            self.unsent.push_back(request);
        }
    }

    /// Feed bytes from the socket and answer every request that is now complete.
    pub fn on_receive(&mut self, data: &[u8]) {
        self.parser.push(data);

        loop {
            let multiline = self
                .pending
                .front()
                .map(|req| req.expect_multiline)
                .unwrap_or(false);

            let Some(response) = self.parser.extract_response(multiline) else {
                break;
            };

            let Some(request) = self.pending.pop_front() else {
                // Protocol sync is lost at this point; there is nothing to pair with.
                error!("Unsolicited response from server: {}", response);
                break;
            };

            debug!("POP3 < {} ({} lines)", response.line_as_string(0).trim_end(), response.lines.len());

            if let Some(next) = self.unsent.pop_front() {
                self.send_request(next);
            }

            request.respond(response);
        }
    }

    /// Fail every outstanding and parked request; later sends fail immediately.
    pub fn on_close(&mut self) {
        self.closed = true;

        let pending = std::mem::take(&mut self.pending);
        let unsent = std::mem::take(&mut self.unsent);
        for request in pending.into_iter().chain(unsent) {
            request.respond_with_error("(connection closed, no response)");
        }
    }

    /// Encoded bytes to write, in order.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn unsent_count(&self) -> usize {
        self.unsent.len()
    }
}
