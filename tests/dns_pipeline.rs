//! End-to-end tests for the DNS pipeline: resolver + ALG + blocklists.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::svcb::{IpHint, SvcParamKey, SvcParamValue};
use hickory_proto::rr::rdata::{A, AAAA, HTTPS, SVCB};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::sync::mpsc;

use tungate::dns::ids;
use tungate::{
    AlgConfig, DnsListener, DnsSummary, NatPt, NetProto, QueryError, QueryStatus, Resolver,
    StaticDomainFilter, Transport, TransportKind, TunMode,
};

/// Transport that answers from a canned zone and counts queries.
struct ZoneTransport {
    id: String,
    zone: Vec<(String, RecordType, RData)>,
    queries: AtomicUsize,
    truncate_udp: bool,
}

impl ZoneTransport {
    fn preferred(zone: Vec<(String, RecordType, RData)>) -> Arc<Self> {
        Arc::new(Self {
            id: ids::PREFERRED.to_string(),
            zone,
            queries: AtomicUsize::new(0),
            truncate_udp: false,
        })
    }
}

#[async_trait]
impl Transport for ZoneTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Dns53
    }

    async fn query(
        &self,
        network: NetProto,
        q: &[u8],
        _summary: &mut DnsSummary,
    ) -> Result<Vec<u8>, QueryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let query = Message::from_vec(q).map_err(|e| QueryError::bad_query(e.to_string()))?;

        let mut rsp = Message::new();
        rsp.set_id(query.id());
        rsp.set_message_type(MessageType::Response);
        rsp.set_op_code(OpCode::Query);
        for question in query.queries() {
            rsp.add_query(question.clone());
            let qname = question.name().to_utf8().to_lowercase();
            for (name, rtype, data) in &self.zone {
                if *rtype == question.query_type() && qname.trim_end_matches('.') == name {
                    rsp.add_answer(Record::from_rdata(
                        question.name().clone(),
                        300,
                        data.clone(),
                    ));
                }
            }
        }

        if self.truncate_udp && network == NetProto::Udp {
            rsp.set_truncated(true);
            rsp.take_answers();
        }

        rsp.to_vec()
            .map_err(|e| QueryError::bad_response(e.to_string()))
    }

    fn addr(&self) -> &str {
        "203.0.113.53:53"
    }

    fn status(&self) -> QueryStatus {
        QueryStatus::Complete
    }
}

struct Recorder {
    chosen: String,
    tx: mpsc::UnboundedSender<DnsSummary>,
}

impl DnsListener for Recorder {
    fn on_query(&self, _qname: &str, _suggested: &str) -> String {
        self.chosen.clone()
    }

    fn on_response(&self, summary: &DnsSummary) {
        let _ = self.tx.send(summary.clone());
    }
}

fn build_resolver(
    upstream: Arc<ZoneTransport>,
) -> (Arc<Resolver>, mpsc::UnboundedReceiver<DnsSummary>) {
    // An empty choice defers to the resolver, which falls back to the ALG.
    build_resolver_via("", upstream)
}

fn build_resolver_via(
    chosen: &str,
    upstream: Arc<ZoneTransport>,
) -> (Arc<Resolver>, mpsc::UnboundedReceiver<DnsSummary>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let resolver = Resolver::new(
        "10.111.222.3:53",
        AlgConfig::default(),
        Arc::new(TunMode::default()),
        upstream,
        Arc::new(Recorder {
            chosen: chosen.to_string(),
            tx,
        }),
        Arc::new(NatPt::new()),
    );
    (resolver, rx)
}

fn wire_query(name: &str, rtype: RecordType) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(0x4242);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    msg.to_vec().unwrap()
}

fn a_answers(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn alg_rewrite_and_reverse_lookups() {
    let real = Ipv4Addr::new(93, 184, 216, 34);
    let upstream = ZoneTransport::preferred(vec![(
        "good.example".into(),
        RecordType::A,
        RData::A(A(real)),
    )]);
    let (resolver, mut summaries) = build_resolver(upstream);

    let out = resolver
        .forward(&wire_query("good.example.", RecordType::A))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();

    // QNAME preserved; answer rewritten into the synthetic pool.
    assert_eq!(msg.queries()[0].name().to_utf8(), "good.example.");
    let synth = a_answers(&msg)[0];
    let gw = resolver.gateway();
    assert!(gw.contains(IpAddr::V4(synth)));
    assert_ne!(synth, real);

    // Immediate reverse lookups resolve the binding.
    assert_eq!(gw.ptr(IpAddr::V4(synth), false), "good.example");
    assert_eq!(gw.x(IpAddr::V4(synth)), real.to_string());
    assert_eq!(gw.rdnsbl(IpAddr::V4(synth)), "");

    let summary = summaries.recv().await.unwrap();
    assert_eq!(summary.qname, "good.example");
    assert_eq!(summary.id, ids::ALG);
    assert_eq!(summary.status, QueryStatus::Complete);
    assert!(summary.latency >= 0.0);
}

#[tokio::test]
async fn block_by_question_answers_without_transport() {
    let upstream = ZoneTransport::preferred(vec![(
        "ads.example".into(),
        RecordType::A,
        RData::A(A(Ipv4Addr::new(203, 0, 113, 80))),
    )]);
    let counted = Arc::clone(&upstream);
    let (resolver, mut summaries) = build_resolver(upstream);

    let filter = StaticDomainFilter::new();
    filter.add("ads.example", "OISD");
    resolver.set_domain_filter(Some(Arc::new(filter)));

    let out = resolver
        .forward(&wire_query("ads.example.", RecordType::A))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();

    assert_eq!(msg.response_code(), ResponseCode::NoError);
    assert_eq!(a_answers(&msg), vec![Ipv4Addr::UNSPECIFIED]);
    assert_eq!(msg.answers()[0].ttl(), 10);
    assert_eq!(counted.queries.load(Ordering::SeqCst), 0);

    let summary = summaries.recv().await.unwrap();
    assert_eq!(summary.blocklists, "OISD");
    assert_eq!(summary.status, QueryStatus::Complete);
}

#[tokio::test]
async fn block_by_answer_on_cname_target() {
    let upstream = ZoneTransport::preferred(vec![
        (
            "alias.example".into(),
            RecordType::A,
            RData::CNAME(hickory_proto::rr::rdata::CNAME(
                Name::from_str("cdn.tracker.example.").unwrap(),
            )),
        ),
        (
            "alias.example".into(),
            RecordType::A,
            RData::A(A(Ipv4Addr::new(203, 0, 113, 7))),
        ),
    ]);
    let (resolver, mut summaries) = build_resolver(upstream);

    let filter = StaticDomainFilter::new();
    filter.add("tracker.example", "EasyPrivacy");
    resolver.set_domain_filter(Some(Arc::new(filter)));

    let out = resolver
        .forward(&wire_query("alias.example.", RecordType::A))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();
    assert_eq!(a_answers(&msg), vec![Ipv4Addr::UNSPECIFIED]);

    let summary = summaries.recv().await.unwrap();
    assert_eq!(summary.blocklists, "EasyPrivacy");
}

#[tokio::test]
async fn https_hints_drawn_from_synthetic_pools() {
    let svcb = SVCB::new(
        1,
        Name::from_str("web.example.").unwrap(),
        vec![
            (
                SvcParamKey::Ipv4Hint,
                SvcParamValue::Ipv4Hint(IpHint(vec![A(Ipv4Addr::new(93, 184, 216, 34))])),
            ),
            (
                SvcParamKey::Ipv6Hint,
                SvcParamValue::Ipv6Hint(IpHint(vec![AAAA(
                    "2606:2800:220:1::1".parse().unwrap(),
                )])),
            ),
        ],
    );
    let upstream = ZoneTransport::preferred(vec![(
        "web.example".into(),
        RecordType::HTTPS,
        RData::HTTPS(HTTPS(svcb)),
    )]);
    let (resolver, _summaries) = build_resolver(upstream);

    let out = resolver
        .forward(&wire_query("web.example.", RecordType::HTTPS))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();

    let gw = resolver.gateway();
    let mut hinted = 0;
    for record in msg.answers() {
        let Some(RData::HTTPS(HTTPS(svcb))) = record.data() else {
            continue;
        };
        for (_, value) in svcb.svc_params() {
            match value {
                SvcParamValue::Ipv4Hint(hint) => {
                    for a in &hint.0 {
                        hinted += 1;
                        assert!(gw.contains(IpAddr::V4(a.0)), "{} not synthetic", a.0);
                    }
                }
                SvcParamValue::Ipv6Hint(hint) => {
                    for aaaa in &hint.0 {
                        hinted += 1;
                        assert!(gw.contains(IpAddr::V6(aaaa.0)), "{} not synthetic", aaaa.0);
                    }
                }
                _ => {}
            }
        }
    }
    assert_eq!(hinted, 2, "both hint families rewritten");
}

#[tokio::test]
async fn truncated_udp_retries_over_tcp() {
    let upstream = Arc::new(ZoneTransport {
        id: ids::PREFERRED.to_string(),
        zone: vec![(
            "big.example".into(),
            RecordType::A,
            RData::A(A(Ipv4Addr::new(198, 51, 100, 77))),
        )],
        queries: AtomicUsize::new(0),
        truncate_udp: true,
    });
    let counted = Arc::clone(&upstream);
    let (resolver, _summaries) = build_resolver(upstream);

    let out = resolver
        .forward(&wire_query("big.example.", RecordType::A))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();

    // udp first, then the tcp retry carried the answer (rewritten).
    assert_eq!(counted.queries.load(Ordering::SeqCst), 2);
    assert!(!msg.truncated());
    let synth = a_answers(&msg)[0];
    assert!(resolver.gateway().contains(IpAddr::V4(synth)));
}

#[tokio::test]
async fn dns64_synthesizes_aaaa_for_registered_transport() {
    // Preferred answers A but has no AAAA for the name; the embedder
    // routes straight to it, and DNS64 is registered for its id.
    let upstream = ZoneTransport::preferred(vec![(
        "v4only.example".into(),
        RecordType::A,
        RData::A(A(Ipv4Addr::new(192, 0, 2, 33))),
    )]);
    let (resolver, _summaries) = build_resolver_via(ids::PREFERRED, upstream);
    resolver.natpt().add64(ids::PREFERRED);

    let out = resolver
        .forward(&wire_query("v4only.example.", RecordType::AAAA))
        .await
        .unwrap();
    let msg = Message::from_vec(&out).unwrap();

    let aaaa: Vec<Ipv6Addr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::AAAA(a)) => Some(a.0),
            _ => None,
        })
        .collect();
    assert_eq!(aaaa.len(), 1);
    let natpt = resolver.natpt();
    assert!(natpt.is_nat64(ids::PREFERRED, IpAddr::V6(aaaa[0])));
    assert_eq!(
        natpt.x64(ids::PREFERRED, IpAddr::V6(aaaa[0])),
        Some(Ipv4Addr::new(192, 0, 2, 33))
    );
}
