//! DNS engine end to end on localhost
//!
//! ```text
//! test client ──UDP/TCP──> DnsEngine ──> "test."          static IPs
//!                                    ──> "cluster.local." service directory
//!                                    ──> "."              fake recursor
//! ```

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use kwt_net::dns::exchange::exchange;
use kwt_net::dns::{
    ClusterResolver, DnsAddrs, DnsBuildOpts, DnsEngine, DnsResult, IpResolver, StaticDomains,
    StaticServiceDirectory, Transport,
};

const UPSTREAM_ANSWER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 55);

// ============================================================================
// Test Helpers
// ============================================================================

/// UDP recursor answering every question with [`UPSTREAM_ANSWER`]
async fn fake_recursor() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_available(true);
            for q in query.queries() {
                reply.add_query(q.clone());
                reply.add_answer(Record::from_rdata(
                    q.name().clone(),
                    300,
                    RData::A(A(UPSTREAM_ANSWER)),
                ));
            }
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        }
    });

    addr
}

struct RunningEngine {
    engine: Arc<DnsEngine>,
    addrs: DnsAddrs,
    serving: JoinHandle<DnsResult<()>>,
}

async fn start_engine(recursor: SocketAddr) -> RunningEngine {
    let mut services = BTreeMap::new();
    services.insert("prod/db".to_string(), "10.96.0.10".parse().unwrap());
    let cluster = ClusterResolver::new(
        "cluster.local.",
        Arc::new(StaticServiceDirectory::new(services)),
    );

    let mut domains = BTreeMap::new();
    domains.insert(
        "test.".to_string(),
        IpResolver::StaticIps(vec![
            "10.0.0.7".parse().unwrap(),
            "10.0.0.8".parse().unwrap(),
        ]),
    );
    domains.insert("cluster.local.".to_string(), IpResolver::Cluster(Arc::new(cluster)));

    let engine = Arc::new(DnsEngine::build(DnsBuildOpts {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        recursors: vec![recursor],
        domains: Arc::new(StaticDomains(domains)),
        on_changed: None,
        mdns_resolver: None,
    }));

    let (started_tx, started_rx) = oneshot::channel();
    let serving = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.serve(started_tx).await })
    };
    let addrs = started_rx.await.unwrap();

    RunningEngine {
        engine,
        addrs,
        serving,
    }
}

async fn ask(addrs: DnsAddrs, transport: Transport, name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(0x1234)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));

    let server = match transport {
        Transport::Udp => addrs.udp,
        Transport::Tcp => addrs.tcp,
    };
    let raw = exchange(&msg.to_vec().unwrap(), server, transport, Duration::from_secs(10))
        .await
        .unwrap();
    Message::from_vec(&raw).unwrap()
}

fn a_records(msg: &Message) -> Vec<(IpAddr, u32)> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some((IpAddr::V4(a.0), r.ttl())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_mapped_domain_answered_authoritatively() {
    let running = start_engine(fake_recursor().await).await;

    let reply = ask(running.addrs, Transport::Udp, "app.test.", RecordType::A).await;
    assert_eq!(reply.id(), 0x1234);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.authoritative());
    assert_eq!(
        a_records(&reply),
        vec![
            ("10.0.0.7".parse().unwrap(), 0),
            ("10.0.0.8".parse().unwrap(), 0),
        ]
    );

    let reply = ask(running.addrs, Transport::Udp, "app.test.", RecordType::AAAA).await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.answers().is_empty());

    let reply = ask(running.addrs, Transport::Udp, "app.test.", RecordType::TXT).await;
    assert_eq!(reply.response_code(), ResponseCode::ServFail);

    running.engine.shutdown();
    running.serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cluster_service_over_tcp() {
    let running = start_engine(fake_recursor().await).await;

    let reply = ask(
        running.addrs,
        Transport::Tcp,
        "db.prod.svc.cluster.local.",
        RecordType::A,
    )
    .await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(a_records(&reply), vec![("10.96.0.10".parse().unwrap(), 0)]);

    let reply = ask(
        running.addrs,
        Transport::Tcp,
        "10-8-0-4.prod.pod.cluster.local.",
        RecordType::A,
    )
    .await;
    assert_eq!(a_records(&reply), vec![("10.8.0.4".parse().unwrap(), 0)]);

    // Unknown service
    let reply = ask(
        running.addrs,
        Transport::Tcp,
        "cache.prod.svc.cluster.local.",
        RecordType::A,
    )
    .await;
    assert_eq!(reply.response_code(), ResponseCode::ServFail);

    running.engine.shutdown();
    running.serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_other_names_forwarded_to_recursor() {
    let running = start_engine(fake_recursor().await).await;

    let reply = ask(running.addrs, Transport::Udp, "example.com.", RecordType::A).await;
    assert_eq!(reply.id(), 0x1234);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(a_records(&reply), vec![(IpAddr::V4(UPSTREAM_ANSWER), 300)]);

    running.engine.shutdown();
    running.serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dead_recursor_gives_servfail() {
    let dead = {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    };
    let running = start_engine(dead).await;

    let reply = ask(running.addrs, Transport::Udp, "example.com.", RecordType::A).await;
    assert_eq!(reply.response_code(), ResponseCode::ServFail);

    running.engine.shutdown();
    running.serving.await.unwrap().unwrap();
}
