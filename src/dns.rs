//! Loopback DNS responder
//!
//! Answers every IPv4 address question with `127.0.0.1` so any name under the
//! development domain reaches the router. Nothing else is served: no zones,
//! no recursion, no TCP.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// TTL of every answer, in seconds
pub const ANSWER_TTL: u32 = 60;

/// Largest datagram read from the socket
const MAX_DATAGRAM_LEN: usize = 4096;

/// A UDP DNS server bound to one address
pub struct DnsServer {
    socket: UdpSocket,
}

impl DnsServer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind DNS socket {}: {}", addr, e))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer queries until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "DNS responder listening");
        }

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => warn!(error = %e, "Failed to receive DNS datagram"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("DNS responder shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        let query = match Message::from_vec(datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Dropping malformed DNS datagram");
                return;
            }
        };

        if query.message_type() != MessageType::Query {
            debug!(peer = %peer, id = query.id(), "Ignoring DNS message that is not a query");
            return;
        }

        let response = answer(&query);
        debug!(
            peer = %peer,
            id = query.id(),
            questions = query.queries().len(),
            answers = response.answers().len(),
            "Answering DNS query"
        );

        match response.to_vec() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, peer).await {
                    warn!(peer = %peer, error = %e, "Failed to send DNS response");
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "Failed to encode DNS response"),
        }
    }
}

/// Build the response to `query`.
///
/// The id and opcode are reused, recursion-desired is echoed and the question
/// section is copied. Each `IN A` question gets one loopback answer; every
/// other question is left unanswered without an error code.
pub fn answer(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_authoritative(true)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(false)
        .set_response_code(ResponseCode::NoError);

    for question in query.queries() {
        response.add_query(question.clone());
        if question.query_type() == RecordType::A && question.query_class() == DNSClass::IN {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                ANSWER_TTL,
                RData::A(A(Ipv4Addr::LOCALHOST)),
            ));
        }
    }

    response
}
