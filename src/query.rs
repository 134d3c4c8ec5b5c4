use std::fmt;
use std::io;
use std::net::IpAddr;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::*;

use crate::transport::Channel;
use crate::util::trim_root;

pub const TRANSACTION_ID: u16 = 1;
pub const MAX_REPLY_SIZE: usize = 2048;

/// Name and address taken from the first answer record of a reply. The
/// address is `None` when the reply has no answers or the first answer is
/// neither A nor AAAA; any further answers are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub address: Option<IpAddr>,
}

impl Answer {
    fn empty(domain: &str) -> Self {
        Answer {
            name: domain.to_string(),
            address: None,
        }
    }

    /// The address as printed, empty when nothing was resolved.
    pub fn address_string(&self) -> String {
        self.address.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.name, self.address_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid domain name {0:?}: {1}")]
    InvalidName(String, ProtoError),
    #[error("Failed to send query: {0}")]
    Send(io::Error),
    #[error("Failed to receive reply: {0}")]
    Receive(io::Error),
    #[error("Malformed reply: {0}")]
    Decode(ProtoError),
}

/// Builds the single-question A/IN query sent for `domain`. Unicode names
/// go out as punycode.
pub fn build_query(domain: &str) -> Result<Message, QueryError> {
    let name =
        Name::from_utf8(domain).map_err(|e| QueryError::InvalidName(domain.to_string(), e))?;
    let mut message = Message::new();
    message
        .set_id(TRANSACTION_ID)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    Ok(message)
}

/// Picks the first answer of `reply`, falling back to `domain` with no
/// address when there is none.
pub fn first_answer(domain: &str, reply: &Message) -> Answer {
    let Some(record) = reply.answers().first() else {
        return Answer::empty(domain);
    };
    if reply.answers().len() > 1 {
        debug!(
            "Ignoring {} further answers for {domain}",
            reply.answers().len() - 1
        );
    }
    let address = match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        other => {
            debug!("First answer for {domain} carries no address: {other:?}");
            None
        }
    };
    Answer {
        name: trim_root(&record.name().to_utf8()).to_string(),
        address,
    }
}

/// One round trip on `channel`: send the query, read one reply, decode it.
pub async fn exchange(domain: &str, channel: &mut dyn Channel) -> Result<Answer, QueryError> {
    let request = build_query(domain)?;
    let bytes = request
        .to_vec()
        .map_err(|e| QueryError::InvalidName(domain.to_string(), e))?;

    trace!("Sending {} byte query for {domain}", bytes.len());
    channel.send(&bytes).await.map_err(QueryError::Send)?;

    trace!("Awaiting reply for {domain}");
    let mut buf = vec![0u8; MAX_REPLY_SIZE];
    let n = channel.recv(&mut buf).await.map_err(QueryError::Receive)?;
    if n >= buf.len() {
        return Err(QueryError::Receive(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Reply for {domain} exceeds {MAX_REPLY_SIZE} bytes"),
        )));
    }

    trace!("Decoding {n} byte reply for {domain}");
    let reply = Message::from_vec(&buf[..n]).map_err(QueryError::Decode)?;
    if reply.id() != TRANSACTION_ID {
        warn!(
            "Reply id {} does not match query id {TRANSACTION_ID}",
            reply.id()
        );
    }

    let answer = first_answer(domain, &reply);
    match answer.address {
        Some(ip) => debug!("Resolved {domain} => {} {ip}", answer.name),
        None => debug!("No address for {domain}"),
    }
    Ok(answer)
}
