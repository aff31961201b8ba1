//! Forwarding session with a recording forwarder and no tunnel
//!
//! The forwarder records the ports it was built with instead of installing
//! rules, so the test connects to those ports directly, standing in for the
//! kernel redirect.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use kwt_net::dns::exchange::exchange;
use kwt_net::dns::{DnsBuildOpts, DnsEngine, IpResolver, StaticDomains, Transport};
use kwt_net::error::ForwarderError;
use kwt_net::forwarder::{Forwarder, ForwarderFactory};
use kwt_net::origdst::StaticOrigDst;
use kwt_net::session::ForwardingProxy;
use kwt_net::tunnel::LocalDialer;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct Journal {
    ports: Mutex<Option<(u16, u16, u16)>>,
    events: Mutex<Vec<String>>,
}

struct JournalForwarder(Arc<Journal>);

impl Forwarder for JournalForwarder {
    fn check_prereqs(&self) -> Result<(), ForwarderError> {
        self.0.events.lock().push("check_prereqs".into());
        Ok(())
    }

    fn add(&mut self, subnets: &[IpNet], dns_ips: &[IpAddr]) -> Result<(), ForwarderError> {
        let subnets: Vec<String> = subnets.iter().map(ToString::to_string).collect();
        let dns_ips: Vec<String> = dns_ips.iter().map(ToString::to_string).collect();
        self.0
            .events
            .lock()
            .push(format!("add [{}] [{}]", subnets.join(" "), dns_ips.join(" ")));
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ForwarderError> {
        self.0.events.lock().push("reset".into());
        Ok(())
    }
}

struct JournalFactory(Arc<Journal>);

impl ForwarderFactory for JournalFactory {
    fn new_forwarder(
        &self,
        dst_tcp_port: u16,
        dst_dns_tcp_port: u16,
        dst_dns_udp_port: u16,
    ) -> Result<Box<dyn Forwarder>, ForwarderError> {
        *self.0.ports.lock() = Some((dst_tcp_port, dst_dns_tcp_port, dst_dns_udp_port));
        Ok(Box::new(JournalForwarder(Arc::clone(&self.0))))
    }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

async fn wait_for_ready(journal: &Journal) -> (u16, u16, u16) {
    for _ in 0..300 {
        let added = journal.events.lock().iter().any(|e| e.starts_with("add"));
        if added {
            if let Some(ports) = *journal.ports.lock() {
                return ports;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never became ready");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_session_relays_tcp_and_answers_dns() {
    let echo = echo_server().await;
    let journal = Arc::new(Journal::default());

    let mut domains = BTreeMap::new();
    domains.insert(
        "svc.test.".to_string(),
        IpResolver::Static("10.0.0.9".parse().unwrap()),
    );
    let dns = DnsEngine::build(DnsBuildOpts {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        recursors: vec!["127.0.0.1:1".parse().unwrap()],
        domains: Arc::new(StaticDomains(domains)),
        on_changed: None,
        mdns_resolver: None,
    });

    let proxy = Arc::new(ForwardingProxy::new(
        Arc::new(JournalFactory(Arc::clone(&journal))),
        Arc::new(StaticOrigDst::new(echo)),
        Arc::new(dns),
    ));

    let serving = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let subnets: Vec<IpNet> = vec!["10.0.0.0/24".parse().unwrap()];
            let dns_ips: Vec<IpAddr> = vec!["10.0.0.2".parse().unwrap()];
            proxy.serve(Arc::new(LocalDialer), &subnets, &dns_ips).await
        })
    };

    let (tcp_port, _dns_tcp_port, dns_udp_port) = wait_for_ready(&journal).await;

    // A "redirected" connection reaches the original destination
    let mut client = TcpStream::connect(("127.0.0.1", tcp_port)).await.unwrap();
    client.write_all(b"through the proxy").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"through the proxy");

    // A "redirected" DNS query is answered by the engine
    let mut query = Message::new();
    query
        .set_id(7)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query);
    query.add_query(Query::query(Name::from_str("api.svc.test.").unwrap(), RecordType::A));
    let raw = exchange(
        &query.to_vec().unwrap(),
        SocketAddr::from(([127, 0, 0, 1], dns_udp_port)),
        Transport::Udp,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let reply = Message::from_vec(&raw).unwrap();
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(matches!(
        reply.answers()[0].data(),
        Some(RData::A(a)) if a.0.to_string() == "10.0.0.9"
    ));

    proxy.shutdown();
    serving.await.unwrap().unwrap();

    assert_eq!(
        *journal.events.lock(),
        vec![
            "check_prereqs".to_string(),
            "add [10.0.0.0/24] [10.0.0.2]".to_string(),
            "reset".to_string(),
        ]
    );
}
