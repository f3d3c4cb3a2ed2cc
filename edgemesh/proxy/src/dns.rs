//! Answers A queries for services with their synthetic IPs.

use edgemesh_core::split_service_domain;
use edgemesh_index::Registry;
use hickory_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{rdata::A, RData, Record, RecordType},
};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

pub const TTL: u32 = 60;

const MAX_PACKET: usize = 4096;

/// Builds the response to a DNS query, or `None` if the packet should be dropped.
///
/// Names are reduced to a service key; bound services are answered with a single authoritative
/// A record. Every other query gets an empty answer without an error code so that the client
/// moves on to the next nameserver.
pub fn handle(packet: &[u8], registry: &Registry) -> Option<Vec<u8>> {
    let query = match Message::from_vec(packet) {
        Ok(msg) => msg,
        Err(error) => {
            debug!(%error, "Dropping malformed query");
            return None;
        }
    };
    if query.message_type() != MessageType::Query || query.op_code() != OpCode::Query {
        return None;
    }
    let [question] = query.queries() else {
        debug!(questions = query.queries().len(), "Dropping query");
        return None;
    };

    let mut rsp = Message::new();
    rsp.set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(query.recursion_desired())
        .set_response_code(ResponseCode::NoError)
        .add_query(question.clone());

    if question.query_type() == RecordType::A {
        let name = question.name().to_utf8();
        let ip = split_service_domain(&name).and_then(|key| registry.lookup_ip(&key));
        match ip {
            Some(ip) => {
                trace!(%name, %ip, "Answering");
                rsp.add_answer(Record::from_rdata(
                    question.name().clone(),
                    TTL,
                    RData::A(A(ip)),
                ));
            }
            None => trace!(%name, "Unknown service"),
        }
    }

    match rsp.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            None
        }
    }
}

/// Serves DNS on `socket` until the process shuts down.
pub async fn serve(
    socket: UdpSocket,
    registry: Arc<Registry>,
    drain: drain::Watch,
) -> io::Result<()> {
    let addr = socket.local_addr()?;
    info!(%addr, "DNS responder listening");
    let mut buf = vec![0u8; MAX_PACKET];
    let signaled = drain.signaled();
    tokio::pin!(signaled);
    loop {
        let (n, peer): (usize, SocketAddr) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(error) => {
                    warn!(%error, "Failed to receive query");
                    continue;
                }
            },
            _ = &mut signaled => {
                debug!("DNS responder shutting down");
                return Ok(());
            }
        };
        if let Some(rsp) = handle(&buf[..n], &registry) {
            if let Err(error) = socket.send_to(&rsp, peer).await {
                debug!(%peer, %error, "Failed to send response");
            }
        }
    }
}
