//! Answers for `.local` multicast queries

use std::net::IpAddr;
use std::time::Instant;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA, NULL};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tracing::{debug, error, info};

use crate::dns::resolver::IpResolver;

/// TTL of multicast answers
pub const MDNS_TTL: u32 = 5;

/// A reply and where it goes
#[derive(Debug, Clone)]
pub struct MdnsReply {
    pub message: Message,
    /// Send to the querier rather than the group
    pub unicast: bool,
}

/// Builds authoritative answers from an [`IpResolver`]
pub struct MdnsHandler {
    resolver: IpResolver,
}

impl MdnsHandler {
    #[must_use]
    pub const fn new(resolver: IpResolver) -> Self {
        Self { resolver }
    }

    /// Answer `query`, or `None` when the names are not ours
    pub async fn answer(&self, query: &Message) -> Option<MdnsReply> {
        let started = Instant::now();
        let first = query.queries().first()?;
        let unicast = first.mdns_unicast_response();

        let mut answers = Vec::new();
        let mut additionals = Vec::new();
        let mut authoritative = false;

        for question in query.queries() {
            let mut v4 = Vec::new();
            let mut v6 = Vec::new();

            if matches!(question.query_type(), RecordType::A | RecordType::AAAA) {
                let name = question.name().to_ascii();

                let res4 = match self.resolver.resolve_ipv4(&name).await {
                    Ok(res) => res,
                    Err(e) => {
                        error!(question = %name, error = %e, "Failed resolving IPv4 question");
                        return None;
                    }
                };
                let res6 = match self.resolver.resolve_ipv6(&name).await {
                    Ok(res) => res,
                    Err(e) => {
                        error!(question = %name, error = %e, "Failed resolving IPv6 question");
                        return None;
                    }
                };

                authoritative = authoritative || res4.resolved || res6.resolved;
                v4 = res4.ips;
                v6 = res6.ips;

                // Both families go out whatever was asked
                for ip in v4.iter().chain(v6.iter()) {
                    answers.push(address_record(question.name(), *ip));
                }
            }

            if authoritative {
                additionals.push(nsec_record(question.name(), !v4.is_empty(), !v6.is_empty()));
            }
        }

        if !authoritative {
            debug!(id = query.id(), "Skipping answering since not authoritative");
            return None;
        }

        let mut message = Message::new();
        let mut header = *query.header();
        header
            .set_message_type(MessageType::Response)
            .set_authoritative(true);
        message.set_header(header);
        message.add_answers(answers);
        message.add_additionals(additionals);

        info!(id = query.id(), elapsed = ?started.elapsed(), "Answering");
        Some(MdnsReply { message, unicast })
    }
}

fn address_record(name: &Name, ip: IpAddr) -> Record {
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    let mut record = Record::from_rdata(name.clone(), MDNS_TTL, rdata);
    record.set_mdns_cache_flush(true);
    record
}

/// NSEC listing the address types that have data
fn nsec_record(name: &Name, has_a: bool, has_aaaa: bool) -> Record {
    let mut rdata = name.to_bytes().unwrap_or_default();

    // Window 0 bitmap: A is type 1, AAAA is type 28
    let mut bitmap: Vec<u8> = Vec::new();
    if has_a {
        bitmap.resize(1, 0);
        bitmap[0] |= 0x40;
    }
    if has_aaaa {
        bitmap.resize(4, 0);
        bitmap[3] |= 0x08;
    }
    if !bitmap.is_empty() {
        rdata.push(0);
        rdata.push(u8::try_from(bitmap.len()).unwrap_or(32));
        rdata.extend_from_slice(&bitmap);
    }

    let mut record = Record::from_rdata(
        name.clone(),
        MDNS_TTL,
        RData::Unknown {
            code: RecordType::NSEC,
            rdata: NULL::with(rdata),
        },
    );
    record.set_mdns_cache_flush(true);
    record
}
