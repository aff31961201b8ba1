//! DNS request handlers
//!
//! Every server hands a decoded [`Request`] to a [`Handler`] and writes back
//! the [`Reply`]. Handlers never fail: errors turn into DNS response codes.
//!
//! ```text
//! DomainsMux
//!     |-- <domain>.  -> CustomHandler(IpResolver)   authoritative answers
//!     |-- arpa.      -> ArpaHandler(ForwardHandler)
//!     `-- .          -> ForwardHandler              recursor failover
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tracing::{debug, error, info};

use super::error::{DnsError, DnsResult};
use super::exchange::exchange;
use super::pool::FailoverRecursorPool;
use super::resolver::IpResolver;

/// Maximum UDP response size when the client sent no EDNS0 record
pub const MAX_UDP_RESPONSE_SIZE_NO_EDNS: usize = 512;

/// Deadline for one exchange with a recursor
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL of authoritative answers
pub const ANSWER_TTL: u32 = 0;

/// Network class a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// A decoded query plus the bytes it came from
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    pub raw: Vec<u8>,
    pub src: SocketAddr,
    pub transport: Transport,
}

impl Request {
    /// # Errors
    ///
    /// Returns [`DnsError::ParseError`] if `raw` is not a DNS message.
    pub fn decode(raw: Vec<u8>, src: SocketAddr, transport: Transport) -> DnsResult<Self> {
        let message = Message::from_vec(&raw)?;
        Ok(Self {
            message,
            raw,
            src,
            transport,
        })
    }

    /// First question, if any
    #[must_use]
    pub fn question(&self) -> Option<&Query> {
        self.message.queries().first()
    }

    /// UDP payload limit the client advertised
    #[must_use]
    pub fn max_udp_size(&self) -> usize {
        self.message
            .extensions()
            .as_ref()
            .map(|edns| usize::from(edns.max_payload()))
            .filter(|size| *size > 0)
            .unwrap_or(MAX_UDP_RESPONSE_SIZE_NO_EDNS)
    }

    fn log_id(&self) -> String {
        match self.question() {
            Some(q) => format!("{} {} {}", self.message.id(), q.query_type(), q.name()),
            None => format!("{} -", self.message.id()),
        }
    }
}

/// What a handler answers with
#[derive(Debug, Clone)]
pub enum Reply {
    /// A message built locally
    Message(Message),
    /// Bytes relayed from a recursor as-is
    Raw(Vec<u8>),
}

impl Reply {
    /// # Errors
    ///
    /// Returns [`DnsError::SerializeError`] if the message cannot be encoded.
    pub fn into_bytes(self) -> DnsResult<Vec<u8>> {
        match self {
            Self::Message(msg) => msg
                .to_bytes()
                .map_err(|e| DnsError::serialize(format!("failed to serialize response: {e}"))),
            Self::Raw(raw) => Ok(raw),
        }
    }

    /// Decoded form, for inspection
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ParseError`] for raw bytes that do not decode.
    pub fn to_message(&self) -> DnsResult<Message> {
        match self {
            Self::Message(msg) => Ok(msg.clone()),
            Self::Raw(raw) => Ok(Message::from_vec(raw)?),
        }
    }
}

/// Answers one DNS request
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &Request) -> Reply;
}

/// Response skeleton echoing the id and the first question
pub(crate) fn reply_to(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(rcode);
    response.set_header(header);
    if let Some(q) = request.queries().first() {
        response.add_query(q.clone());
    }
    response
}

// ============================================================================
// Custom handler
// ============================================================================

/// Authoritative answers from an [`IpResolver`]
pub struct CustomHandler {
    resolver: IpResolver,
}

impl CustomHandler {
    #[must_use]
    pub const fn new(resolver: IpResolver) -> Self {
        Self { resolver }
    }

    #[must_use]
    pub const fn resolver(&self) -> &IpResolver {
        &self.resolver
    }

    async fn answer(&self, request: &Request) -> Message {
        let Some(question) = request.question() else {
            return reply_to(&request.message, ResponseCode::NoError);
        };

        match question.query_type() {
            RecordType::A | RecordType::ANY => {
                let name = question.name().to_ascii();
                match self.resolver.resolve_ipv4(&name).await {
                    Ok(res) if res.resolved => {
                        let mut msg = reply_to(&request.message, ResponseCode::NoError);
                        for ip in res.ips {
                            if let IpAddr::V4(v4) = ip {
                                msg.add_answer(Record::from_rdata(
                                    question.name().clone(),
                                    ANSWER_TTL,
                                    RData::A(A(v4)),
                                ));
                            }
                        }
                        msg
                    }
                    Ok(_) => reply_to(&request.message, ResponseCode::ServFail),
                    Err(e) => {
                        debug!(question = %name, error = %e, "Resolving failed");
                        reply_to(&request.message, ResponseCode::ServFail)
                    }
                }
            }
            RecordType::AAAA | RecordType::MX => reply_to(&request.message, ResponseCode::NoError),
            _ => reply_to(&request.message, ResponseCode::ServFail),
        }
    }
}

#[async_trait]
impl Handler for CustomHandler {
    async fn handle(&self, request: &Request) -> Reply {
        let started = Instant::now();
        debug!(msg = %request.log_id(), "Received query");

        let mut msg = self.answer(request).await;
        msg.set_authoritative(true);
        msg.set_recursion_available(true);

        info!(
            msg = %request.log_id(),
            rcode = %msg.response_code(),
            elapsed = ?started.elapsed(),
            "Answering"
        );
        Reply::Message(msg)
    }
}

// ============================================================================
// Forward handler
// ============================================================================

/// Relays queries to recursors with failover
pub struct ForwardHandler {
    recursors: Arc<FailoverRecursorPool>,
    timeout: Duration,
}

impl ForwardHandler {
    #[must_use]
    pub fn new(recursors: Arc<FailoverRecursorPool>) -> Self {
        Self {
            recursors,
            timeout: EXCHANGE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Re-encode with name compression when the reply is over the client's
    /// UDP limit
    fn compress_if_needed(request: &Request, raw: Vec<u8>) -> Reply {
        if request.transport != Transport::Udp || raw.len() <= request.max_udp_size() {
            return Reply::Raw(raw);
        }

        match Message::from_vec(&raw) {
            Ok(msg) => {
                debug!(
                    msg = %request.log_id(),
                    size = raw.len(),
                    limit = request.max_udp_size(),
                    "Compressing oversized reply"
                );
                Reply::Message(msg)
            }
            Err(_) => Reply::Raw(raw),
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn handle(&self, request: &Request) -> Reply {
        if request.question().is_none() {
            info!(msg = %request.log_id(), "Received a request with no questions");
            let mut msg = reply_to(&request.message, ResponseCode::NoError);
            msg.set_authoritative(true);
            return Reply::Message(msg);
        }

        debug!(msg = %request.log_id(), "Received query");
        let started = Instant::now();

        let result = self
            .recursors
            .perform_strategically(|recursor| async move {
                exchange(&request.raw, recursor, request.transport, self.timeout)
                    .await
                    .map(|raw| (recursor, raw))
            })
            .await;

        match result {
            Ok((recursor, raw)) => {
                info!(
                    msg = %request.log_id(),
                    via = %recursor,
                    elapsed = ?started.elapsed(),
                    "Answering"
                );
                Self::compress_if_needed(request, raw)
            }
            Err(e) => {
                error!(msg = %request.log_id(), error = %e, "Failed to recurse");
                Reply::Message(reply_to(&request.message, ResponseCode::ServFail))
            }
        }
    }
}

// ============================================================================
// ARPA handler
// ============================================================================

/// Reverse lookups: empty requests are answered locally, the rest forwarded
pub struct ArpaHandler {
    inner: Arc<dyn Handler>,
}

impl ArpaHandler {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Handler for ArpaHandler {
    async fn handle(&self, request: &Request) -> Reply {
        if request.question().is_none() {
            let mut msg = reply_to(&request.message, ResponseCode::NoError);
            msg.set_authoritative(true);
            msg.set_recursion_available(false);
            return Reply::Message(msg);
        }
        self.inner.handle(request).await
    }
}
