//! POP3 connection client
//!
//! One `Pop3Client` owns one connection. A background task owns the socket and
//! the [`Pop3Protocol`]; the client talks to it over a channel and awaits
//! replies. The client never reconnects on its own: once the connection drops
//! its state is `Disconnected` and every outstanding request has failed.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ErrorScope, Pop3Error, Pop3ErrorKind};
use super::mime::{self, MimeContext, ParsedMessage};
use super::parser::Response;
use super::protocol::{Pop3Protocol, Reply, Request};
use super::socket::{self, Pop3Stream};

const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SNIPPET_SIZE_GOAL: usize = 4096;
const DEFAULT_INFER_ATTACHMENTS_SIZE: usize = 512 * 1024;
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Transport security
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crypto {
    Plain,
    #[default]
    Ssl,
    StartTls,
}

impl Crypto {
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Plain | Self::StartTls => 110,
            Self::Ssl => 995,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Ssl => "ssl",
            Self::StartTls => "starttls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Apop,
    Sasl,
    UserPass,
}

/// The fallback order; a preferred method is moved to the front.
const AUTH_METHODS: [AuthMethod; 3] = [AuthMethod::Apop, AuthMethod::Sasl, AuthMethod::UserPass];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Greeting,
    StartTls,
    Authorization,
    Ready,
}

#[derive(Debug, Clone)]
pub struct Pop3Options {
    pub host: String,
    /// `None` picks the default for `crypto`
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub crypto: Crypto,
    pub conn_timeout: Duration,
    pub preferred_auth_method: Option<AuthMethod>,
    /// Bytes to aim for when fetching a snippet with TOP
    pub snippet_size_goal: usize,
    pub infer_attachments_size: usize,
}

impl Pop3Options {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: username.into(),
            password: password.into(),
            crypto: Crypto::default(),
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            preferred_auth_method: None,
            snippet_size_goal: DEFAULT_SNIPPET_SIZE_GOAL,
            infer_attachments_size: DEFAULT_INFER_ATTACHMENTS_SIZE,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.crypto.default_port())
    }

    /// Ordered authentication methods, fixed for the client's lifetime.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::with_capacity(AUTH_METHODS.len());
        if let Some(preferred) = self.preferred_auth_method {
            methods.push(preferred);
        }
        methods.extend(AUTH_METHODS.iter().filter(|m| Some(**m) != self.preferred_auth_method));
        methods
    }
}

/// One maildrop entry from UIDL + LIST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub uidl: String,
    pub size: usize,
    pub number: u32,
}

#[derive(Debug, Default)]
struct MessageListing {
    id_to_uidl: HashMap<u32, String>,
    uidl_to_id: HashMap<String, u32>,
    id_to_size: HashMap<u32, usize>,
    /// Newest first
    messages: Vec<MessageInfo>,
}

/// Options for [`Pop3Client::list_messages`]
#[derive(Default)]
pub struct ListOptions {
    /// Only messages whose UIDL passes are downloaded
    pub filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Download at most this many; the rest are reported as overflow
    pub max_messages: Option<usize>,
    /// Checkpoint after every batch of this many messages
    pub checkpoint_interval: Option<usize>,
}

/// Reported once per successfully downloaded message
#[derive(Debug, Clone)]
pub struct FetchProgress {
    pub total_bytes: usize,
    pub bytes_fetched: usize,
    pub size: usize,
    pub message: ParsedMessage,
}

/// Receives messages as `list_messages` downloads them.
#[async_trait]
pub trait ListingSink: Send {
    async fn on_message(&mut self, progress: FetchProgress);

    /// Called between batches when the batch stored at least one message.
    async fn checkpoint(&mut self) {}
}

#[derive(Debug)]
pub struct ListResult {
    /// First per-message failure; the listing continues past it
    pub first_error: Option<Pop3Error>,
    /// Messages selected for download in this pass
    pub num_synced: usize,
    pub overflow: Vec<MessageInfo>,
}

enum ConnCommand {
    Send(Request),
    UpgradeToSecure(oneshot::Sender<std::io::Result<()>>),
    Close,
}

pub struct Pop3Client {
    options: Pop3Options,
    auth_methods: Vec<AuthMethod>,
    /// The method that worked, once authenticated
    auth_method: Option<AuthMethod>,
    /// Needed for APOP
    greeting_line: Option<String>,
    commands: flume::Sender<ConnCommand>,
    state: Arc<watch::Sender<ClientState>>,
    /// POP3 shows a frozen maildrop for the whole session
    listing: Option<MessageListing>,
}

impl Pop3Client {
    /// Connect, read the greeting, upgrade if asked, and authenticate.
    pub async fn connect(options: Pop3Options) -> Result<Self, Pop3Error> {
        let port = options.port();
        info!(host = %options.host, port = port, crypto = options.crypto.as_str(), "Connecting to POP3 server");

        let stream = socket::open(
            &options.host,
            port,
            options.crypto == Crypto::Ssl,
            options.conn_timeout,
        )
        .await
        .map_err(|e| {
            Pop3Error::new(
                ErrorScope::Connection,
                Pop3ErrorKind::UnresponsiveServer,
                format!(
                    "Could not connect to {}:{} with {} encryption: {}",
                    options.host,
                    port,
                    options.crypto.as_str(),
                    e
                ),
            )
        })?;

        Self::from_stream(options, stream).await
    }

    /// Run the session setup over an already open stream.
    pub async fn from_stream(options: Pop3Options, stream: Box<dyn Pop3Stream>) -> Result<Self, Pop3Error> {
        let (state_tx, _) = watch::channel(ClientState::Greeting);
        let state = Arc::new(state_tx);
        let (commands_tx, commands_rx) = flume::unbounded();

        // The greeting is paired with a placeholder that is never written.
        let mut protocol = Pop3Protocol::new();
        let (greeting, greeting_rx) = Request::greeting();
        protocol.expect_greeting(greeting);

        tokio::spawn(run_connection(
            stream,
            options.host.clone(),
            protocol,
            commands_rx,
            state.clone(),
        ));

        let mut client = Self {
            auth_methods: options.auth_methods(),
            options,
            auth_method: None,
            greeting_line: None,
            commands: commands_tx,
            state,
            listing: None,
        };

        if let Err(e) = client.establish(greeting_rx).await {
            client.close();
            return Err(e);
        }

        client.set_state(ClientState::Ready);
        info!("POP3 session ready for {} via {:?}", client.options.username, client.auth_method);
        Ok(client)
    }

    async fn establish(&mut self, greeting_rx: oneshot::Receiver<Reply>) -> Result<(), Pop3Error> {
        let greeting = match timeout(self.options.conn_timeout, greeting_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Response::error("(connection closed, no response)")),
            Err(_) => {
                return Err(Pop3Error::new(
                    ErrorScope::Connection,
                    Pop3ErrorKind::UnresponsiveServer,
                    format!("No greeting from {} within {:?}", self.options.host, self.options.conn_timeout),
                ))
            }
        };

        let greeting = greeting.map_err(|rsp| {
            Pop3Error::from_response(ErrorScope::Connection, Pop3ErrorKind::UnresponsiveServer, rsp)
        })?;
        self.greeting_line = Some(greeting.line_as_string(0));

        self.maybe_upgrade_connection().await?;
        self.authorize().await
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch state changes, e.g. to notice the server hanging up.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.auth_method
    }

    /// True once the connection task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_disconnected()
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Forcibly disconnect without QUIT.
    pub fn close(&self) {
        if self.state() != ClientState::Disconnected {
            self.set_state(ClientState::Disconnected);
            let _ = self.commands.send(ConnCommand::Close);
        }
    }

    /// QUIT (committing any DELE) and close.
    pub async fn quit(&mut self) -> Result<(), Pop3Error> {
        self.set_state(ClientState::Disconnected);
        let reply = self.request("QUIT", Vec::new(), false).await;
        let _ = self.commands.send(ConnCommand::Close);

        reply.map(|_| ()).map_err(|rsp| {
            Pop3Error::from_response(ErrorScope::Mailbox, Pop3ErrorKind::ServerProblem, rsp)
        })
    }

    fn submit(&self, command: &str, args: Vec<String>, multiline: bool) -> oneshot::Receiver<Reply> {
        let (request, rx) = Request::new(command, args, multiline);
        if let Err(flume::SendError(ConnCommand::Send(request))) = self.commands.send(ConnCommand::Send(request)) {
            // The connection task is gone; answer locally so nobody waits.
            let mut protocol = Pop3Protocol::new();
            protocol.on_close();
            protocol.send_request(request);
        }
        rx
    }

    async fn await_reply(rx: oneshot::Receiver<Reply>) -> Reply {
        rx.await
            .unwrap_or_else(|_| Err(Response::error("(connection closed, no response)")))
    }

    async fn request(&self, command: &str, args: Vec<String>, multiline: bool) -> Reply {
        Self::await_reply(self.submit(command, args, multiline)).await
    }

    async fn maybe_upgrade_connection(&mut self) -> Result<(), Pop3Error> {
        if self.options.crypto != Crypto::StartTls {
            return Ok(());
        }

        self.set_state(ClientState::StartTls);
        self.request("STLS", Vec::new(), false).await.map_err(|rsp| {
            Pop3Error::from_response(ErrorScope::Connection, Pop3ErrorKind::BadSecurity, rsp)
        })?;

        let (tx, rx) = oneshot::channel();
        let bad_security = |message: String| {
            Pop3Error::new(ErrorScope::Connection, Pop3ErrorKind::BadSecurity, message)
        };
        self.commands
            .send(ConnCommand::UpgradeToSecure(tx))
            .map_err(|_| bad_security("connection closed before TLS upgrade".to_string()))?;

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(bad_security(format!("TLS upgrade failed: {}", e))),
            Err(_) => Err(bad_security("connection closed during TLS upgrade".to_string())),
        }
    }

    async fn authorize(&mut self) -> Result<(), Pop3Error> {
        self.set_state(ClientState::Authorization);
        let user = self.options.username.clone();
        let pass = self.options.password.clone();

        for method in self.auth_methods.clone() {
            match method {
                AuthMethod::Apop => {
                    // Servers without a greeting timestamp do not support APOP.
                    let Some(stamp) = self.greeting_line.as_deref().and_then(apop_timestamp) else {
                        continue;
                    };
                    let digest = apop_digest(&stamp, &pass);
                    match self.request("APOP", vec![user.clone(), digest], false).await {
                        Ok(_) => {
                            self.auth_method = Some(AuthMethod::Apop);
                            return Ok(());
                        }
                        Err(rsp) => {
                            debug!("APOP rejected: {}", rsp.status_line());
                            self.greeting_line = None;
                        }
                    }
                }
                AuthMethod::Sasl => {
                    let secret = BASE64.encode(format!("{}\0{}\0{}", user, user, pass));
                    match self.request("AUTH", vec!["PLAIN".to_string(), secret], false).await {
                        Ok(_) => {
                            self.auth_method = Some(AuthMethod::Sasl);
                            return Ok(());
                        }
                        Err(rsp) => debug!("AUTH PLAIN rejected: {}", rsp.status_line()),
                    }
                }
                AuthMethod::UserPass => return self.user_pass(&user, &pass).await,
            }
        }

        self.user_pass(&user, &pass).await
    }

    async fn user_pass(&mut self, user: &str, pass: &str) -> Result<(), Pop3Error> {
        self.request("USER", vec![user.to_string()], false)
            .await
            .map_err(|rsp| {
                Pop3Error::from_response(ErrorScope::Authentication, Pop3ErrorKind::BadUserOrPass, rsp)
            })?;

        self.request("PASS", vec![pass.to_string()], false)
            .await
            .map_err(|rsp| {
                let mut err = Pop3Error::from_response(
                    ErrorScope::Authentication,
                    Pop3ErrorKind::BadUserOrPass,
                    rsp,
                );
                err.request = None;
                err
            })?;

        self.auth_method = Some(AuthMethod::UserPass);
        Ok(())
    }

    /// UIDL + LIST, cached for the session. Newest message first.
    async fn load_message_list(&mut self) -> Result<&MessageListing, Pop3Error> {
        if self.listing.is_none() {
            let server_problem = |rsp: Response| {
                Pop3Error::from_response(ErrorScope::Mailbox, Pop3ErrorKind::ServerProblem, rsp)
            };

            // POP3 servers process commands serially, so LIST can go out
            // before UIDL has been answered.
            let uidl_rx = self.submit("UIDL", Vec::new(), true);
            let list_rx = self.submit("LIST", Vec::new(), true);

            let uidl_rsp = Self::await_reply(uidl_rx).await.map_err(server_problem)?;
            let list_rsp = Self::await_reply(list_rx).await.map_err(server_problem)?;

            let mut listing = MessageListing::default();
            for line in uidl_rsp.data_lines() {
                let mut words = line.split(' ');
                let (Some(number), Some(uidl)) = (words.next(), words.next()) else {
                    continue;
                };
                if let Ok(number) = number.parse::<u32>() {
                    listing.id_to_uidl.insert(number, uidl.to_string());
                    listing.uidl_to_id.insert(uidl.to_string(), number);
                }
            }

            for line in list_rsp.data_lines() {
                let mut words = line.split(' ');
                let (Some(number), Some(size)) = (words.next(), words.next()) else {
                    continue;
                };
                let (Ok(number), Ok(size)) = (number.parse::<u32>(), size.parse::<usize>()) else {
                    continue;
                };
                listing.id_to_size.insert(number, size);
                match listing.id_to_uidl.get(&number) {
                    Some(uidl) => listing.messages.push(MessageInfo {
                        uidl: uidl.clone(),
                        size,
                        number,
                    }),
                    None => warn!("POP3 message {} has no UIDL, skipping", number),
                }
            }

            // Servers list oldest first; process the newest first.
            listing.messages.reverse();
            self.listing = Some(listing);
        }

        self.listing.as_ref().ok_or_else(|| {
            Pop3Error::new(ErrorScope::Mailbox, Pop3ErrorKind::ServerProblem, "message list unavailable")
        })
    }

    /// All messages on the server, newest first.
    pub async fn message_list(&mut self) -> Result<Vec<MessageInfo>, Pop3Error> {
        Ok(self.load_message_list().await?.messages.clone())
    }

    /// Download snippets for every message passing the filter, in batches.
    pub async fn list_messages(
        &mut self,
        opts: ListOptions,
        sink: &mut dyn ListingSink,
    ) -> Result<ListResult, Pop3Error> {
        let all = self.load_message_list().await?.messages.clone();

        let max_messages = opts.max_messages.unwrap_or(usize::MAX);
        let mut messages = Vec::new();
        let mut overflow = Vec::new();
        let mut seen_count = 0;
        let mut total_bytes = 0;

        for info in all {
            let wanted = opts.filter.as_ref().map_or(true, |filter| filter(&info.uidl));
            if !wanted {
                seen_count += 1;
            } else if messages.len() < max_messages {
                total_bytes += info.size;
                messages.push(info);
            } else {
                overflow.push(info);
            }
        }

        info!(
            "POP3: listMessages found {} new, {} overflow, and {} seen messages",
            messages.len(),
            overflow.len(),
            seen_count
        );

        let num_synced = messages.len();
        let batch_size = opts.checkpoint_interval.filter(|n| *n > 0).unwrap_or(num_synced.max(1));
        let mut first_error: Option<Pop3Error> = None;
        let mut bytes_fetched = 0;
        let mut remaining = messages.into_iter().peekable();

        while remaining.peek().is_some() && !self.is_closed() {
            let batch: Vec<MessageInfo> = remaining.by_ref().take(batch_size).collect();
            debug!("POP3: next batch of {} messages", batch.len());

            // Queue the whole batch up front; the pipeline writes them in turn.
            let lines = self.snippet_line_count();
            let pending: Vec<(MessageInfo, oneshot::Receiver<Reply>)> = batch
                .into_iter()
                .map(|info| {
                    let rx = self.submit("TOP", vec![info.number.to_string(), lines.to_string()], true);
                    (info, rx)
                })
                .collect();

            let mut any_saved = false;
            for (info, rx) in pending {
                let result = self.finish_partial(info.number, Self::await_reply(rx).await);
                bytes_fetched += info.size;
                match result {
                    Ok(message) => {
                        any_saved = true;
                        sink.on_message(FetchProgress {
                            total_bytes,
                            bytes_fetched,
                            size: info.size,
                            message,
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!("POP3: failed to fetch message {}: {}", info.uidl, e);
                        first_error.get_or_insert(e);
                    }
                }
            }

            if any_saved {
                debug!("POP3: checkpoint");
                sink.checkpoint().await;
            }
        }

        info!(
            "POP3: sync complete, {} messages synced, {} overflow messages",
            num_synced,
            overflow.len()
        );

        Ok(ListResult {
            first_error,
            num_synced,
            overflow,
        })
    }

    fn snippet_line_count(&self) -> usize {
        self.options.snippet_size_goal / 80
    }

    /// Fetch roughly `snippet_size_goal` bytes of a message with TOP.
    pub async fn download_partial_message_by_number(&mut self, number: u32) -> Result<ParsedMessage, Pop3Error> {
        let lines = self.snippet_line_count();
        let reply = self
            .request("TOP", vec![number.to_string(), lines.to_string()], true)
            .await;
        self.finish_partial(number, reply)
    }

    fn finish_partial(&self, number: u32, reply: Reply) -> Result<ParsedMessage, Pop3Error> {
        let rsp = reply.map_err(|rsp| {
            Pop3Error::from_response(ErrorScope::Message, Pop3ErrorKind::ServerProblem, rsp)
        })?;

        let full_size = self.size_of(number);
        let data = rsp.data_as_string();
        let is_snippet = match full_size {
            None | Some(0) => true,
            Some(size) => data.len() < size,
        };
        self.parse(&data, is_snippet, Some(number))
    }

    /// Fetch a whole message with RETR.
    pub async fn download_message_by_number(&mut self, number: u32) -> Result<ParsedMessage, Pop3Error> {
        let rsp = self
            .request("RETR", vec![number.to_string()], true)
            .await
            .map_err(|rsp| {
                Pop3Error::from_response(ErrorScope::Message, Pop3ErrorKind::ServerProblem, rsp)
            })?;
        self.parse(&rsp.data_as_string(), false, Some(number))
    }

    /// Fetch a whole message by its stable id.
    pub async fn download_message_by_uidl(&mut self, uidl: &str) -> Result<ParsedMessage, Pop3Error> {
        let number = self.load_message_list().await?.uidl_to_id.get(uidl).copied();
        match number {
            Some(number) => self.download_message_by_number(number).await,
            None => Err(Pop3Error::new(
                ErrorScope::Message,
                Pop3ErrorKind::ServerProblem,
                format!("No message with UIDL {} on the server", uidl),
            )),
        }
    }

    fn size_of(&self, number: u32) -> Option<usize> {
        self.listing
            .as_ref()
            .and_then(|l| l.id_to_size.get(&number).copied())
    }

    fn parse(&self, data: &str, is_snippet: bool, number: Option<u32>) -> Result<ParsedMessage, Pop3Error> {
        let listing = self.listing.as_ref();
        let uidl = number.and_then(|n| listing.and_then(|l| l.id_to_uidl.get(&n).cloned()));
        let est_size = number.and_then(|n| self.size_of(n)).unwrap_or(data.len());

        let ctx = MimeContext {
            uidl,
            est_size,
            is_snippet,
            infer_attachments_size: self.options.infer_attachments_size,
            now_ms: chrono::Utc::now().timestamp_millis(),
        };

        mime::parse_message(data, &ctx).map_err(|e| {
            Pop3Error::new(
                ErrorScope::Message,
                Pop3ErrorKind::ServerProblem,
                format!("Could not parse message: {}", e),
            )
        })
    }
}

impl Drop for Pop3Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// First `<...>` token of the greeting.
fn apop_timestamp(greeting: &str) -> Option<String> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    Some(greeting[start..=end].to_string())
}

/// Lowercase hex MD5 of timestamp + password.
fn apop_digest(timestamp: &str, password: &str) -> String {
    let digest = Md5::digest(format!("{}{}", timestamp, password).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

async fn run_connection(
    mut stream: Box<dyn Pop3Stream>,
    host: String,
    mut protocol: Pop3Protocol,
    commands: flume::Receiver<ConnCommand>,
    state: Arc<watch::Sender<ClientState>>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let mut write_failed = false;
        for bytes in protocol.take_outgoing() {
            if let Err(e) = stream.write_all(&bytes).await {
                warn!("POP3 write to {} failed: {}", host, e);
                write_failed = true;
                break;
            }
        }
        if write_failed || stream.flush().await.is_err() {
            break;
        }

        tokio::select! {
            command = commands.recv_async() => match command {
                Ok(ConnCommand::Send(request)) => protocol.send_request(request),
                Ok(ConnCommand::UpgradeToSecure(reply)) => match stream.upgrade_to_secure(&host).await {
                    Ok(secure) => {
                        stream = secure;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        protocol.on_close();
                        state.send_replace(ClientState::Disconnected);
                        return;
                    }
                },
                Ok(ConnCommand::Close) | Err(_) => {
                    let _ = stream.shutdown().await;
                    break;
                }
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("POP3 server {} closed the connection", host);
                    break;
                }
                Ok(n) => protocol.on_receive(&buf[..n]),
                Err(e) => {
                    warn!("POP3 socket error from {}: {}", host, e);
                    break;
                }
            },
        }
    }

    protocol.on_close();
    state.send_replace(ClientState::Disconnected);
    debug!("POP3 connection to {} closed", host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Scripted server: for each expected command prefix, the raw reply to send.
    async fn serve(server: DuplexStream, greeting: &str, script: Vec<(&'static str, String)>) -> Vec<String> {
        let (read, mut write) = tokio::io::split(server);
        let mut reader = BufReader::new(read);
        let mut received = Vec::new();

        write.write_all(greeting.as_bytes()).await.unwrap();
        for (expected, reply) in script {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            assert!(line.starts_with(expected), "expected {} got {}", expected, line);
            received.push(line);
            write.write_all(reply.as_bytes()).await.unwrap();
        }
        received
    }

    fn options() -> Pop3Options {
        let mut opts = Pop3Options::new("pop.example.com", "bob", "secret");
        opts.crypto = Crypto::Plain;
        opts.conn_timeout = Duration::from_secs(5);
        opts
    }

    fn message(subject: &str, body: &str) -> String {
        format!(
            "Subject: {}\r\nDate: Tue, 14 Nov 2023 10:00:00 +0000\r\nContent-Type: text/plain\r\n\r\n{}\r\n.\r\n",
            subject, body
        )
    }

    #[test]
    fn test_auth_method_order() {
        let mut opts = options();
        assert_eq!(
            opts.auth_methods(),
            vec![AuthMethod::Apop, AuthMethod::Sasl, AuthMethod::UserPass]
        );
        opts.preferred_auth_method = Some(AuthMethod::UserPass);
        assert_eq!(
            opts.auth_methods(),
            vec![AuthMethod::UserPass, AuthMethod::Apop, AuthMethod::Sasl]
        );
    }

    #[test]
    fn test_default_ports() {
        let mut opts = options();
        assert_eq!(opts.port(), 110);
        opts.crypto = Crypto::Ssl;
        assert_eq!(opts.port(), 995);
        opts.port = Some(1995);
        assert_eq!(opts.port(), 1995);
    }

    #[test]
    fn test_apop_digest_matches_rfc1939() {
        let stamp = apop_timestamp("+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n").unwrap();
        assert_eq!(stamp, "<1896.697170952@dbc.mtview.ca.us>");
        assert_eq!(apop_digest(&stamp, "tanstaaf"), "c4c9334bac560ecc979e58001b3e22fb");
        assert!(apop_timestamp("+OK ready\r\n").is_none());
    }

    #[tokio::test]
    async fn test_apop_login() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready <1896.697170952@dbc.mtview.ca.us>\r\n",
            vec![("APOP bob ", "+OK maildrop locked\r\n".to_string())],
        ));

        let client = Pop3Client::from_stream(options(), Box::new(client_end)).await.unwrap();
        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(client.auth_method(), Some(AuthMethod::Apop));
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_falls_through_to_user_pass() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let plain = BASE64.encode("bob\0bob\0secret");
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready <stamp@host>\r\n",
            vec![
                ("APOP bob ", "-ERR no apop\r\n".to_string()),
                ("AUTH PLAIN", "-ERR no sasl\r\n".to_string()),
                ("USER bob", "+OK\r\n".to_string()),
                ("PASS secret", "+OK logged in\r\n".to_string()),
            ],
        ));

        let client = Pop3Client::from_stream(options(), Box::new(client_end)).await.unwrap();
        assert_eq!(client.auth_method(), Some(AuthMethod::UserPass));
        drop(client);

        let received = server.await.unwrap();
        assert_eq!(received[1], format!("AUTH PLAIN {}", plain));
    }

    #[tokio::test]
    async fn test_bad_password_is_auth_error() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let mut opts = options();
        opts.preferred_auth_method = Some(AuthMethod::UserPass);
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready\r\n",
            vec![
                ("USER bob", "+OK\r\n".to_string()),
                ("PASS secret", "-ERR invalid password\r\n".to_string()),
            ],
        ));

        let err = Pop3Client::from_stream(opts, Box::new(client_end)).await.err().unwrap();
        assert_eq!(err.scope, ErrorScope::Authentication);
        assert_eq!(err.kind, Pop3ErrorKind::BadUserOrPass);
        assert_eq!(err.message, "invalid password");
        assert!(err.request.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_greeting() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(server_end, "-ERR go away\r\n", vec![]));

        let err = Pop3Client::from_stream(options(), Box::new(client_end)).await.err().unwrap();
        assert_eq!(err.kind, Pop3ErrorKind::UnresponsiveServer);
        assert_eq!(err.message, "go away");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_refused() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let mut opts = options();
        opts.crypto = Crypto::StartTls;
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready\r\n",
            vec![("STLS", "-ERR not supported\r\n".to_string())],
        ));

        let err = Pop3Client::from_stream(opts, Box::new(client_end)).await.err().unwrap();
        assert_eq!(err.scope, ErrorScope::Connection);
        assert_eq!(err.kind, Pop3ErrorKind::BadSecurity);
        server.await.unwrap();
    }

    struct CollectingSink {
        subjects: Vec<String>,
        checkpoints: usize,
    }

    #[async_trait]
    impl ListingSink for CollectingSink {
        async fn on_message(&mut self, progress: FetchProgress) {
            self.subjects
                .push(progress.message.header.subject.clone().unwrap_or_default());
        }

        async fn checkpoint(&mut self) {
            self.checkpoints += 1;
        }
    }

    #[tokio::test]
    async fn test_list_messages_newest_first_with_overflow() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready\r\n",
            vec![
                ("USER bob", "+OK\r\n".to_string()),
                ("PASS secret", "+OK\r\n".to_string()),
                ("UIDL", "+OK\r\n1 u-old\r\n2 u-mid\r\n3 u-new\r\n4 u-seen\r\n.\r\n".to_string()),
                ("LIST", "+OK\r\n1 100\r\n2 100\r\n3 100\r\n4 100\r\n.\r\n".to_string()),
                ("TOP 3 51", format!("+OK\r\n{}", message("newest", "n"))),
                ("TOP 2 51", format!("+OK\r\n{}", message("middle", "m"))),
            ],
        ));

        let mut opts = options();
        opts.preferred_auth_method = Some(AuthMethod::UserPass);
        let mut client = Pop3Client::from_stream(opts, Box::new(client_end)).await.unwrap();

        let mut sink = CollectingSink {
            subjects: Vec::new(),
            checkpoints: 0,
        };
        let result = client
            .list_messages(
                ListOptions {
                    filter: Some(Box::new(|uidl: &str| uidl != "u-seen")),
                    max_messages: Some(2),
                    checkpoint_interval: Some(1),
                },
                &mut sink,
            )
            .await
            .unwrap();

        assert!(result.first_error.is_none());
        assert_eq!(result.num_synced, 2);
        assert_eq!(result.overflow.len(), 1);
        assert_eq!(result.overflow[0].uidl, "u-old");
        assert_eq!(sink.subjects, vec!["newest", "middle"]);
        assert_eq!(sink.checkpoints, 2);

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_by_uidl_and_quit() {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready\r\n",
            vec![
                ("USER bob", "+OK\r\n".to_string()),
                ("PASS secret", "+OK\r\n".to_string()),
                ("UIDL", "+OK\r\n1 abc\r\n.\r\n".to_string()),
                ("LIST", "+OK\r\n1 90\r\n.\r\n".to_string()),
                ("RETR 1", format!("+OK\r\n{}", message("full", "..dotted line"))),
                ("QUIT", "+OK bye\r\n".to_string()),
            ],
        ));

        let mut opts = options();
        opts.preferred_auth_method = Some(AuthMethod::UserPass);
        let mut client = Pop3Client::from_stream(opts, Box::new(client_end)).await.unwrap();

        let msg = client.download_message_by_uidl("abc").await.unwrap();
        assert_eq!(msg.header.srvid.as_deref(), Some("abc"));
        assert_eq!(msg.header.snippet.as_deref(), Some(".dotted line"));
        assert!(msg.body.body_reps[0].is_downloaded);
        assert_eq!(msg.body.body_reps[1].rep_type, "fake");

        let missing = client.download_message_by_uidl("nope").await.err().unwrap();
        assert_eq!(missing.scope, ErrorScope::Message);

        client.quit().await.unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_hangup_fails_outstanding_requests() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve(
            server_end,
            "+OK ready\r\n",
            vec![
                ("USER bob", "+OK\r\n".to_string()),
                ("PASS secret", "+OK\r\n".to_string()),
            ],
        ));

        let mut opts = options();
        opts.preferred_auth_method = Some(AuthMethod::UserPass);
        let mut client = Pop3Client::from_stream(opts, Box::new(client_end)).await.unwrap();
        let mut state = client.subscribe_state();

        // The script ends and the server side is dropped.
        server.await.unwrap();

        let err = client.download_partial_message_by_number(1).await.err().unwrap();
        assert_eq!(err.scope, ErrorScope::Message);
        assert!(err.message.contains("connection closed") || err.message.contains("after connection closed"));

        state.wait_for(|s| *s == ClientState::Disconnected).await.unwrap();
        assert!(client.is_closed());
    }
}
