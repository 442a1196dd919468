//! DNS wire helpers
//!
//! Thin utilities over hickory-proto shared by the resolver, the ALG, and
//! the DNS64 synthesizer: qname normalization, record extraction, record
//! substitution, and refusal/servfail synthesis.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::svcb::{IpHint, SvcParamKey, SvcParamValue};
use hickory_proto::rr::rdata::{A, AAAA, HTTPS, SVCB};
use hickory_proto::rr::{RData, Record, RecordType};

use crate::error::QueryError;

/// Smallest well-formed DNS message (header only).
pub const MIN_DNS_PACKET_SIZE: usize = 12;

/// Largest DNS message the resolver will relay.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Placeholder qname reported for unparseable queries.
pub const INVALID_QNAME: &str = "invalid.query";

/// Parse a wire message.
///
/// # Errors
///
/// Returns a bad-query [`QueryError`] when the bytes do not parse.
pub fn parse(wire: &[u8]) -> Result<Message, QueryError> {
    if wire.len() < MIN_DNS_PACKET_SIZE {
        return Err(QueryError::bad_query(format!(
            "short packet: {} bytes",
            wire.len()
        )));
    }
    Message::from_vec(wire).map_err(|e| QueryError::bad_query(e.to_string()))
}

/// Serialize a message.
///
/// # Errors
///
/// Returns a bad-response [`QueryError`] when serialization fails.
pub fn pack(msg: &Message) -> Result<Vec<u8>, QueryError> {
    msg.to_vec().map_err(|e| QueryError::bad_response(e.to_string()))
}

/// Normalized (lowercase, no trailing dot) qname of the first question.
#[must_use]
pub fn qname(msg: &Message) -> String {
    msg.queries()
        .first()
        .map(|q| normalize_name(&q.name().to_utf8()))
        .unwrap_or_default()
}

/// Lowercase a name and strip the trailing dot.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Numeric qtype of the first question (0 when absent).
#[must_use]
pub fn qtype(msg: &Message) -> u16 {
    msg.queries()
        .first()
        .map_or(0, |q| u16::from(q.query_type()))
}

/// Numeric response code.
#[must_use]
pub fn rcode(msg: &Message) -> u16 {
    u16::from(msg.response_code())
}

/// Largest answer TTL (0 when there are no answers).
#[must_use]
pub fn rttl(msg: &Message) -> u32 {
    msg.answers().iter().map(Record::ttl).max().unwrap_or(0)
}

/// Smallest answer TTL, if any answers exist.
#[must_use]
pub fn min_ttl(msg: &Message) -> Option<u32> {
    msg.answers().iter().map(Record::ttl).min()
}

/// True when the raw packet has the TC (truncated) flag set.
#[must_use]
pub fn has_tc_flag(wire: &[u8]) -> bool {
    wire.len() > 2 && (wire[2] & 0x02) != 0
}

/// IPv4 addresses from the answer's A records.
#[must_use]
pub fn a_answers(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

/// IPv6 addresses from the answer's AAAA records.
#[must_use]
pub fn aaaa_answers(msg: &Message) -> Vec<Ipv6Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::AAAA(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

/// Normalized CNAME targets in the answer section.
#[must_use]
pub fn cname_targets(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::CNAME(c)) => Some(normalize_name(&c.0.to_utf8())),
            _ => None,
        })
        .collect()
}

fn svcb_of(record: &Record) -> Option<&SVCB> {
    match record.data() {
        Some(RData::SVCB(s)) => Some(s),
        Some(RData::HTTPS(HTTPS(s))) => Some(s),
        _ => None,
    }
}

/// All ipv4hint / ipv6hint values from SVCB and HTTPS answers.
#[must_use]
pub fn svcb_ip_hints(msg: &Message) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for svcb in msg.answers().iter().filter_map(svcb_of) {
        for (key, value) in svcb.svc_params() {
            match (key, value) {
                (SvcParamKey::Ipv4Hint, SvcParamValue::Ipv4Hint(hint)) => {
                    v4.extend(hint.0.iter().map(|a| a.0));
                }
                (SvcParamKey::Ipv6Hint, SvcParamValue::Ipv6Hint(hint)) => {
                    v6.extend(hint.0.iter().map(|a| a.0));
                }
                _ => {}
            }
        }
    }
    (v4, v6)
}

/// True when the first question asks for A.
#[must_use]
pub fn has_a_question(msg: &Message) -> bool {
    msg.queries()
        .first()
        .is_some_and(|q| q.query_type() == RecordType::A)
}

/// True when the first question asks for AAAA.
#[must_use]
pub fn has_aaaa_question(msg: &Message) -> bool {
    msg.queries()
        .first()
        .is_some_and(|q| q.query_type() == RecordType::AAAA)
}

/// True when the first question asks for SVCB or HTTPS.
#[must_use]
pub fn has_svcb_question(msg: &Message) -> bool {
    msg.queries().first().is_some_and(|q| {
        matches!(q.query_type(), RecordType::SVCB | RecordType::HTTPS)
    })
}

/// Rewrite every A answer to `ip` with `ttl`. Returns how many were
/// rewritten.
pub fn subst_a_records(msg: &mut Message, ip: Ipv4Addr, ttl: u32) -> usize {
    subst_records(msg, ttl, |data| match data {
        RData::A(_) => Some(RData::A(A(ip))),
        _ => None,
    })
}

/// Rewrite every AAAA answer to `ip` with `ttl`. Returns how many were
/// rewritten.
pub fn subst_aaaa_records(msg: &mut Message, ip: Ipv6Addr, ttl: u32) -> usize {
    subst_records(msg, ttl, |data| match data {
        RData::AAAA(_) => Some(RData::AAAA(AAAA(ip))),
        _ => None,
    })
}

/// Rewrite the ipv4hint / ipv6hint fields of every SVCB and HTTPS answer.
/// Returns how many records were rewritten.
pub fn subst_svcb_hints(
    msg: &mut Message,
    ip4: Option<Ipv4Addr>,
    ip6: Option<Ipv6Addr>,
    ttl: u32,
) -> usize {
    subst_records(msg, ttl, |data| {
        let (svcb, wrap_https) = match data {
            RData::SVCB(s) => (s, false),
            RData::HTTPS(HTTPS(s)) => (s, true),
            _ => return None,
        };

        let mut touched = false;
        let params: Vec<(SvcParamKey, SvcParamValue)> = svcb
            .svc_params()
            .iter()
            .map(|(key, value)| match (key, ip4, ip6) {
                (SvcParamKey::Ipv4Hint, Some(ip), _) => {
                    touched = true;
                    (*key, SvcParamValue::Ipv4Hint(IpHint(vec![A(ip)])))
                }
                (SvcParamKey::Ipv6Hint, _, Some(ip)) => {
                    touched = true;
                    (*key, SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(ip)])))
                }
                _ => (*key, value.clone()),
            })
            .collect();

        if !touched {
            return None;
        }

        let rewritten = SVCB::new(svcb.svc_priority(), svcb.target_name().clone(), params);
        Some(if wrap_https {
            RData::HTTPS(HTTPS(rewritten))
        } else {
            RData::SVCB(rewritten)
        })
    })
}

fn subst_records<F>(msg: &mut Message, ttl: u32, mut rewrite: F) -> usize
where
    F: FnMut(&RData) -> Option<RData>,
{
    let mut n = 0;
    let answers = msg.take_answers();
    let rewritten: Vec<Record> = answers
        .into_iter()
        .map(|record| match record.data().and_then(&mut rewrite) {
            Some(data) => {
                n += 1;
                let mut r = Record::from_rdata(record.name().clone(), ttl, data);
                r.set_dns_class(record.dns_class());
                r
            }
            None => record,
        })
        .collect();
    msg.insert_answers(rewritten);
    n
}

/// A NOERROR response answering the question with the unspecified address
/// (A = 0.0.0.0, AAAA = ::), used as the fixed block refusal.
#[must_use]
pub fn refused_response(query: &Message, ttl: u32) -> Message {
    let mut rsp = response_from(query);
    rsp.set_response_code(ResponseCode::NoError);

    for q in query.queries() {
        let data = match q.query_type() {
            RecordType::A => Some(RData::A(A(Ipv4Addr::UNSPECIFIED))),
            RecordType::AAAA => Some(RData::AAAA(AAAA(Ipv6Addr::UNSPECIFIED))),
            _ => None,
        };
        if let Some(data) = data {
            let mut record = Record::from_rdata(q.name().clone(), ttl, data);
            record.set_dns_class(q.query_class());
            rsp.add_answer(record);
        }
    }
    rsp
}

/// An empty response mirroring `query`'s header and questions.
#[must_use]
pub fn response_from(query: &Message) -> Message {
    let mut rsp = Message::new();
    let mut header = Header::response_from_request(query.header());
    header.set_message_type(MessageType::Response);
    rsp.set_header(header);
    for q in query.queries() {
        rsp.add_query(q.clone());
    }
    rsp
}

/// SERVFAIL bytes for a raw query, if the query parses.
#[must_use]
pub fn servfail(query_wire: &[u8]) -> Option<Vec<u8>> {
    let query = parse(query_wire).ok()?;
    let mut rsp = response_from(&query);
    rsp.set_response_code(ResponseCode::ServFail);
    rsp.to_vec().ok()
}

/// A short digest of the answer for summaries: a csv of answer addresses,
/// falling back to the first CNAME target.
#[must_use]
pub fn interesting_rdata(msg: &Message) -> String {
    let mut parts: Vec<String> = a_answers(msg).iter().map(Ipv4Addr::to_string).collect();
    parts.extend(aaaa_answers(msg).iter().map(Ipv6Addr::to_string));
    if parts.is_empty() {
        if let Some(target) = cname_targets(msg).into_iter().next() {
            return target;
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    fn a_query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn with_a_answer(name: &str, ip: Ipv4Addr, ttl: u32) -> Message {
        let mut msg = a_query(name);
        msg.set_message_type(MessageType::Response);
        msg.add_answer(Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(ip)),
        ));
        msg
    }

    #[test]
    fn test_qname_is_normalized() {
        let msg = a_query("GoOd.Example.");
        assert_eq!(qname(&msg), "good.example");
        assert_eq!(qtype(&msg), 1);
    }

    #[test]
    fn test_parse_rejects_short_packets() {
        assert!(parse(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_a_answer_extraction_and_ttl() {
        let msg = with_a_answer("good.example.", Ipv4Addr::new(93, 184, 216, 34), 300);
        assert_eq!(a_answers(&msg), vec![Ipv4Addr::new(93, 184, 216, 34)]);
        assert_eq!(rttl(&msg), 300);
        assert_eq!(min_ttl(&msg), Some(300));
    }

    #[test]
    fn test_subst_a_records() {
        let mut msg = with_a_answer("good.example.", Ipv4Addr::new(93, 184, 216, 34), 300);
        let n = subst_a_records(&mut msg, Ipv4Addr::new(198, 18, 0, 1), 10);
        assert_eq!(n, 1);
        assert_eq!(a_answers(&msg), vec![Ipv4Addr::new(198, 18, 0, 1)]);
        assert_eq!(msg.answers()[0].ttl(), 10);
    }

    #[test]
    fn test_subst_svcb_hints() {
        let mut msg = a_query("svc.example.");
        msg.set_message_type(MessageType::Response);
        let svcb = SVCB::new(
            1,
            Name::from_str("svc.example.").unwrap(),
            vec![
                (
                    SvcParamKey::Ipv4Hint,
                    SvcParamValue::Ipv4Hint(IpHint(vec![A(Ipv4Addr::new(93, 184, 216, 34))])),
                ),
                (
                    SvcParamKey::Ipv6Hint,
                    SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(Ipv6Addr::LOCALHOST)])),
                ),
            ],
        );
        msg.add_answer(Record::from_rdata(
            Name::from_str("svc.example.").unwrap(),
            300,
            RData::HTTPS(HTTPS(svcb)),
        ));

        let fake4 = Ipv4Addr::new(198, 18, 0, 7);
        let fake6: Ipv6Addr = "64:ff9b:1:da7a::7".parse().unwrap();
        let n = subst_svcb_hints(&mut msg, Some(fake4), Some(fake6), 10);
        assert_eq!(n, 1);

        let (v4, v6) = svcb_ip_hints(&msg);
        assert_eq!(v4, vec![fake4]);
        assert_eq!(v6, vec![fake6]);
    }

    #[test]
    fn test_refused_response_shape() {
        let query = a_query("ads.example.");
        let rsp = refused_response(&query, 10);
        assert_eq!(rsp.id(), query.id());
        assert_eq!(rsp.response_code(), ResponseCode::NoError);
        assert_eq!(a_answers(&rsp), vec![Ipv4Addr::UNSPECIFIED]);
        assert_eq!(rsp.answers()[0].ttl(), 10);
    }

    #[test]
    fn test_servfail_roundtrip() {
        let wire = a_query("broken.example.").to_vec().unwrap();
        let rsp = servfail(&wire).unwrap();
        let parsed = Message::from_vec(&rsp).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::ServFail);
        assert_eq!(qname(&parsed), "broken.example");
    }

    #[test]
    fn test_interesting_rdata_prefers_addresses() {
        let msg = with_a_answer("good.example.", Ipv4Addr::new(93, 184, 216, 34), 60);
        assert_eq!(interesting_rdata(&msg), "93.184.216.34");
    }
}
