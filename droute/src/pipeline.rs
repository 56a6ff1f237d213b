//! The per-request query pipeline (C6): the fixed decision state
//! machine of blocklist -> cloaking/CNAME-chase -> forwarding ->
//! answer-IP filtering described for the server.

use crate::config::{Config, Upstream};
use crate::dispatch::{self, AddressFamily, DispatchOutcome};
use crate::log_sink::{LogSink, RequestLog};
use bytes::{Bytes, BytesMut};
use dmatcher::store::Decision;
use dmatcher::{CloakingRecordType, CloakingRule};
use domain::base::iana::{Opcode, Rcode, Rtype};
use domain::base::{Message, MessageBuilder, ParsedDname};
use domain::rdata::AllRecordData;
use rand::seq::SliceRandom;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

const SYNTHESIZED_TTL: u32 = 900;

type DispatchFuture<'a> = Pin<Box<dyn Future<Output = DispatchOutcome> + Send + 'a>>;

/// Injection seam for the upstream dispatch call. Defaults to
/// [`dispatch::dispatch`]; tests substitute a mock upstream here so the
/// pipeline's decision logic can be driven end-to-end without a real
/// network.
pub type DispatchFn = Arc<
    dyn for<'a> Fn(&'a Upstream, AddressFamily, &'a [u8], &'a reqwest::Client) -> DispatchFuture<'a>
        + Send
        + Sync,
>;

/// Shared, read-only state every handler consults. Cheap to clone: the
/// config and HTTP client are held behind `Arc`, and `LogSink` is
/// itself a cloneable channel handle.
#[derive(Clone)]
pub struct Pipeline {
    /// The loaded configuration and compiled rule store.
    pub config: Arc<Config>,
    /// The shared request-log sink.
    pub log_sink: LogSink,
    /// The shared HTTP/2-capable client used for DoH dispatch.
    pub http_client: Arc<reqwest::Client>,
    dispatch_fn: DispatchFn,
}

impl Pipeline {
    /// Build a pipeline that dispatches to real upstreams over the
    /// network via [`dispatch::dispatch`].
    pub fn new(config: Arc<Config>, log_sink: LogSink, http_client: Arc<reqwest::Client>) -> Self {
        Self {
            config,
            log_sink,
            http_client,
            dispatch_fn: Arc::new(|upstream, family, query, client| {
                Box::pin(dispatch::dispatch(upstream, family, query, client))
            }),
        }
    }

    /// Build a pipeline with a substituted dispatch function, for tests
    /// that want to drive `handle()` against a mock upstream.
    #[cfg(test)]
    fn with_dispatch_fn(
        config: Arc<Config>,
        log_sink: LogSink,
        http_client: Arc<reqwest::Client>,
        dispatch_fn: DispatchFn,
    ) -> Self {
        Self {
            config,
            log_sink,
            http_client,
            dispatch_fn,
        }
    }

    /// Handle one inbound wire-format query. Returns the wire-format
    /// reply, or `None` if the query was malformed and should be
    /// silently dropped.
    pub async fn handle(&self, client_ip: IpAddr, family: AddressFamily, raw: &[u8]) -> Option<Vec<u8>> {
        let msg = Message::<Bytes>::from_octets(Bytes::copy_from_slice(raw)).ok()?;
        let question = msg.sole_question().ok()?;
        let qname = question.qname().to_string();
        let qname = qname.trim_end_matches('.').to_lowercase();
        let qtype = question.qtype();
        let client_ip_str = client_ip.to_string();

        if family == AddressFamily::V6 && !self.config.ipv6_allowed.permits_v6() {
            self.log_pipeline_decision(&client_ip_str, &qname, qtype, None, "NOTIMP");
            return Some(simple_reply(&msg, Rcode::NotImp));
        }
        if msg.header().opcode() != Opcode::Query {
            self.log_pipeline_decision(&client_ip_str, &qname, qtype, None, "NOTIMP");
            return Some(simple_reply(&msg, Rcode::NotImp));
        }

        // BLOCK-NAME
        if qtype == Rtype::Any {
            self.log_pipeline_decision(&client_ip_str, &qname, qtype, None, "REFUSED");
            return Some(simple_reply(&msg, Rcode::Refused));
        }
        if let Some(Decision::Blocked) = self
            .config
            .rule_store
            .match_name_decision(&client_ip_str, &qname)
        {
            self.log_pipeline_decision(&client_ip_str, &qname, qtype, None, "REFUSED");
            return Some(simple_reply(&msg, Rcode::Refused));
        }

        if matches!(qtype, Rtype::A | Rtype::Aaaa) {
            self.cloak_or_forward(&msg, &client_ip_str, &qname, qtype, family).await
        } else {
            // Non-address queries skip cloaking and answer-IP filtering.
            let outcome = self.forward(&qname, &qname, family, raw).await;
            Some(self.finish_forward(&msg, &client_ip_str, &qname, None, qtype, outcome, false))
        }
    }

    async fn cloak_or_forward(
        &self,
        msg: &Message<Bytes>,
        client_ip: &str,
        qname: &str,
        qtype: Rtype,
        family: AddressFamily,
    ) -> Option<Vec<u8>> {
        let resolved = self.config.rule_store.match_cloaking_resolved(qname);
        let matching_type_records: Vec<&CloakingRule> = resolved
            .iter()
            .copied()
            .filter(|r| {
                matches!(
                    (r.record_type, qtype),
                    (CloakingRecordType::A, Rtype::A) | (CloakingRecordType::Aaaa, Rtype::Aaaa)
                )
            })
            .collect();

        if !matching_type_records.is_empty() {
            self.log_pipeline_decision(client_ip, qname, qtype, None, "NOERROR");
            return Some(synthesize_reply(msg, qname, qtype, &matching_type_records));
        }

        if let Some(cname_rule) = resolved
            .iter()
            .find(|r| r.record_type == CloakingRecordType::Cname)
        {
            let cname = cname_rule.mapped.clone();
            if let Some(Decision::Blocked) = self.config.rule_store.match_name_decision(client_ip, &cname) {
                self.log_pipeline_decision(client_ip, qname, qtype, Some(&cname), "REFUSED");
                return Some(simple_reply(msg, Rcode::Refused));
            }
            let cname_query = rebuild_query_with_name(msg, &cname);
            let outcome = self.forward(&cname, &cname, family, &cname_query).await;
            let reply = self.finish_forward(msg, client_ip, qname, Some(&cname), qtype, outcome, true);
            return Some(reply);
        }

        let outcome = self.forward(qname, qname, family, msg.as_slice()).await;
        Some(self.finish_forward(msg, client_ip, qname, None, qtype, outcome, true))
    }

    /// FORWARD: dispatch to the forwarding-rule upstream if one
    /// matches, else iterate `default` in order.
    async fn forward(
        &self,
        qname_for_rule: &str,
        _qname: &str,
        family: AddressFamily,
        raw_query: &[u8],
    ) -> Result<Vec<u8>, ()> {
        if let Some(rule) = self.config.rule_store.match_forwarding(qname_for_rule) {
            if let Some(upstream) = self.config.upstream(&rule.group) {
                let outcome = (self.dispatch_fn)(upstream, family, raw_query, &self.http_client).await;
                self.log_upstream_attempt(qname_for_rule, &outcome);
                return outcome.reply.ok_or(());
            }
        }
        for name in &self.config.default {
            if let Some(upstream) = self.config.upstream(name) {
                let outcome = (self.dispatch_fn)(upstream, family, raw_query, &self.http_client).await;
                self.log_upstream_attempt(qname_for_rule, &outcome);
                if let Some(reply) = outcome.reply {
                    return Ok(reply);
                }
            }
        }
        Err(())
    }

    fn log_upstream_attempt(&self, name: &str, outcome: &dispatch::DispatchOutcome) {
        let mut rec = RequestLog::new("", name, "");
        rec.server = Some(outcome.server.clone());
        rec.elapsed_ms = outcome.elapsed.as_secs_f64() * 1000.0;
        rec.error = outcome.error.as_ref().map(|e| e.error_chain());
        rec.response_status = if outcome.reply.is_some() {
            Some("NOERROR".to_string())
        } else {
            None
        };
        self.log_sink.log(rec);
    }

    fn finish_forward(
        &self,
        msg: &Message<Bytes>,
        client_ip: &str,
        qname: &str,
        cname: Option<&str>,
        qtype: Rtype,
        outcome: Result<Vec<u8>, ()>,
        apply_ip_filter_and_rewrite: bool,
    ) -> Vec<u8> {
        let reply = match outcome {
            Err(()) => {
                self.log_pipeline_decision(client_ip, qname, qtype, cname, "SERVFAIL");
                return simple_reply(msg, Rcode::ServFail);
            }
            Ok(bytes) => bytes,
        };

        let mut reply = reply;
        if apply_ip_filter_and_rewrite {
            if cname.is_some() {
                reply = rewrite_cname_answer(&reply, qname);
            }
            reply = filter_answer_ips(&reply, client_ip, &self.config);
        }
        let status = reply_rcode_text(&reply);
        self.log_pipeline_decision(client_ip, qname, qtype, cname, &status);
        reply
    }

    fn log_pipeline_decision(
        &self,
        client_ip: &str,
        qname: &str,
        qtype: Rtype,
        cname: Option<&str>,
        status: &str,
    ) {
        let mut rec = RequestLog::new(client_ip, qname, format!("{qtype}"));
        rec.cname = cname.map(|s| s.to_string());
        rec.response_status = Some(status.to_string());
        rec.server = None;
        self.log_sink.log(rec);
    }
}

fn simple_reply(query: &Message<Bytes>, rcode: Rcode) -> Vec<u8> {
    let target = BytesMut::with_capacity(query.as_slice().len().max(64));
    match MessageBuilder::from_target(target) {
        Ok(builder) => match builder.start_answer(query, rcode) {
            Ok(answer) => answer.into_message().as_slice().to_vec(),
            Err(_) => fallback_servfail(query),
        },
        Err(_) => fallback_servfail(query),
    }
}

fn fallback_servfail(query: &Message<Bytes>) -> Vec<u8> {
    // Last-resort hand-built SERVFAIL: copy the query's id and question
    // section, flip QR and set rcode, matching RFC 1035 header layout.
    let mut out = query.as_slice().to_vec();
    if out.len() >= 4 {
        out[2] |= 0x80; // QR=1
        out[3] = (out[3] & 0xf0) | (Rcode::ServFail.to_int() & 0x0f);
    }
    out
}

fn synthesize_reply(query: &Message<Bytes>, owner: &str, qtype: Rtype, records: &[&CloakingRule]) -> Vec<u8> {
    let mut chosen: Vec<&&CloakingRule> = records.iter().collect();
    if chosen.len() > 2 {
        chosen.shuffle(&mut rand::thread_rng());
    }

    let target = BytesMut::with_capacity(512);
    let builder = match MessageBuilder::from_target(target) {
        Ok(b) => b,
        Err(_) => return fallback_servfail(query),
    };
    let mut answer = match builder.start_answer(query, Rcode::NoError) {
        Ok(a) => a,
        Err(_) => return fallback_servfail(query),
    };

    let owner_dname = match domain::base::Dname::<Bytes>::from_str(owner) {
        Ok(d) => d,
        Err(_) => return fallback_servfail(query),
    };

    for rule in chosen {
        let pushed = match qtype {
            Rtype::A => rule.mapped.parse::<std::net::Ipv4Addr>().ok().and_then(|ip| {
                answer
                    .push((&owner_dname, SYNTHESIZED_TTL, domain::rdata::A::from(ip)))
                    .ok()
            }),
            Rtype::Aaaa => rule.mapped.parse::<std::net::Ipv6Addr>().ok().and_then(|ip| {
                answer
                    .push((&owner_dname, SYNTHESIZED_TTL, domain::rdata::Aaaa::from(ip)))
                    .ok()
            }),
            _ => None,
        };
        if pushed.is_none() {
            log::warn!("failed to push synthesized cloaking record for {owner}");
        }
    }

    answer.into_message().as_slice().to_vec()
}

fn rebuild_query_with_name(query: &Message<Bytes>, new_name: &str) -> Vec<u8> {
    let question = match query.sole_question() {
        Ok(q) => q,
        Err(_) => return query.as_slice().to_vec(),
    };
    let name = match domain::base::Dname::<Bytes>::from_str(new_name) {
        Ok(d) => d,
        Err(_) => return query.as_slice().to_vec(),
    };
    let target = BytesMut::with_capacity(query.as_slice().len() + new_name.len() + 16);
    let builder = match MessageBuilder::from_target(target) {
        Ok(b) => b,
        Err(_) => return query.as_slice().to_vec(),
    };
    let mut builder = builder;
    *builder.header_mut() = *query.header();
    let mut q = builder.question();
    if q.push((&name, question.qtype())).is_err() {
        return query.as_slice().to_vec();
    }
    q.into_message().as_slice().to_vec()
}

/// Rewrite an upstream's reply to the CNAME target back onto the
/// original question name: drop authority/additional, drop CNAME
/// rrsets, rewrite A/AAAA owner names, NXDOMAIN if nothing is left.
fn rewrite_cname_answer(reply: &[u8], original_name: &str) -> Vec<u8> {
    let msg = match Message::<Bytes>::from_octets(Bytes::copy_from_slice(reply)) {
        Ok(m) => m,
        Err(_) => return reply.to_vec(),
    };
    if msg.header().rcode() != Rcode::NoError {
        return rewrite_question_name_only(&msg, original_name);
    }

    let owner = match domain::base::Dname::<Bytes>::from_str(original_name) {
        Ok(d) => d,
        Err(_) => return reply.to_vec(),
    };

    let target = BytesMut::with_capacity(reply.len() + original_name.len() + 16);
    let builder = match MessageBuilder::from_target(target) {
        Ok(b) => b,
        Err(_) => return reply.to_vec(),
    };
    let mut builder = builder;
    *builder.header_mut() = *msg.header();
    builder.header_mut().set_rcode(Rcode::NoError);

    let mut qb = builder.question();
    if let Ok(q) = msg.sole_question() {
        let _ = qb.push((&owner, q.qtype()));
    }
    let mut ab = qb.answer();

    let mut kept = 0usize;
    if let Ok(answers) = msg.answer() {
        for rec in answers.flatten() {
            if let Ok(Some(r)) = rec.into_record::<AllRecordData<Bytes, ParsedDname<Bytes>>>() {
                match r.data() {
                    AllRecordData::Cname(_) => continue,
                    AllRecordData::A(a) => {
                        if ab.push((&owner, r.ttl(), *a)).is_ok() {
                            kept += 1;
                        }
                    }
                    AllRecordData::Aaaa(a) => {
                        if ab.push((&owner, r.ttl(), *a)).is_ok() {
                            kept += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let mut msg_bytes = ab.into_message().as_slice().to_vec();
    if kept == 0 && msg_bytes.len() >= 4 {
        msg_bytes[3] = (msg_bytes[3] & 0xf0) | (Rcode::NXDomain.to_int() & 0x0f);
    }
    msg_bytes
}

fn rewrite_question_name_only(msg: &Message<Bytes>, original_name: &str) -> Vec<u8> {
    let owner = match domain::base::Dname::<Bytes>::from_str(original_name) {
        Ok(d) => d,
        Err(_) => return msg.as_slice().to_vec(),
    };
    let target = BytesMut::with_capacity(msg.as_slice().len() + original_name.len() + 16);
    let builder = match MessageBuilder::from_target(target) {
        Ok(b) => b,
        Err(_) => return msg.as_slice().to_vec(),
    };
    let mut builder = builder;
    *builder.header_mut() = *msg.header();
    let mut qb = builder.question();
    if let Ok(q) = msg.sole_question() {
        let _ = qb.push((&owner, q.qtype()));
    }
    qb.into_message().as_slice().to_vec()
}

/// IP-FILTER: drop answer A/AAAA records whose address is blocked;
/// drop emptied rrsets; REFUSED if nothing meaningful remains.
fn filter_answer_ips(reply: &[u8], client_ip: &str, config: &Config) -> Vec<u8> {
    let msg = match Message::<Bytes>::from_octets(Bytes::copy_from_slice(reply)) {
        Ok(m) => m,
        Err(_) => return reply.to_vec(),
    };
    if msg.header().rcode() != Rcode::NoError {
        return reply.to_vec();
    }

    let answers: Vec<(domain::base::Dname<Bytes>, u32, AllRecordData<Bytes, ParsedDname<Bytes>>)> =
        match msg.answer() {
            Ok(iter) => iter
                .flatten()
                .filter_map(|rec| rec.into_record::<AllRecordData<Bytes, ParsedDname<Bytes>>>().ok().flatten())
                .filter_map(|r| {
                    let owner = r.owner().to_dname_buf().ok()?;
                    Some((owner, r.ttl(), r.data().clone()))
                })
                .collect(),
            Err(_) => return reply.to_vec(),
        };

    let mut kept = Vec::new();
    let mut saw_cname_only = true;
    for (owner, ttl, data) in answers {
        let ip: Option<IpAddr> = match &data {
            AllRecordData::A(a) => Some(IpAddr::V4(a.addr())),
            AllRecordData::Aaaa(a) => Some(IpAddr::V6(a.addr())),
            _ => None,
        };
        match ip {
            Some(addr) => {
                saw_cname_only = false;
                let blocked = matches!(
                    config.rule_store.match_ip_decision(client_ip, &addr.to_string()),
                    Some(Decision::Blocked)
                );
                if !blocked {
                    kept.push((owner, ttl, data));
                }
            }
            None => kept.push((owner, ttl, data)),
        }
    }

    let has_address_records = kept.iter().any(|(_, _, d)| matches!(d, AllRecordData::A(_) | AllRecordData::Aaaa(_)));
    if kept.is_empty() || (!has_address_records && !saw_cname_only) {
        return refused_like(&msg);
    }

    let target = BytesMut::with_capacity(reply.len());
    let builder = match MessageBuilder::from_target(target) {
        Ok(b) => b,
        Err(_) => return reply.to_vec(),
    };
    let mut builder = builder;
    *builder.header_mut() = *msg.header();
    let mut qb = builder.question();
    if let Ok(q) = msg.sole_question() {
        let _ = qb.push(q);
    }
    let mut ab = qb.answer();
    for (owner, ttl, data) in kept {
        let _ = ab.push((&owner, ttl, &data));
    }
    ab.into_message().as_slice().to_vec()
}

fn refused_like(msg: &Message<Bytes>) -> Vec<u8> {
    simple_reply(msg, Rcode::Refused)
}

fn reply_rcode_text(reply: &[u8]) -> String {
    if reply.len() < 4 {
        return "SERVFAIL".to_string();
    }
    match reply[3] & 0x0f {
        0 => "NOERROR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::base::Dname;

    fn sample_query(name: &str, qtype: Rtype) -> Message<Bytes> {
        let target = BytesMut::with_capacity(64);
        let builder = MessageBuilder::from_target(target).unwrap();
        let dname: Dname<Bytes> = Dname::from_str(name).unwrap();
        let mut qb = builder.question();
        qb.push((&dname, qtype)).unwrap();
        Message::from_octets(Bytes::from(qb.into_message().as_slice().to_vec())).unwrap()
    }

    #[test]
    fn simple_reply_sets_qr_and_rcode() {
        let query = sample_query("example.com", Rtype::A);
        let reply = simple_reply(&query, Rcode::Refused);
        assert_eq!(reply_rcode_text(&reply), "REFUSED");
        assert!(reply[2] & 0x80 != 0, "QR bit must be set on a reply");
    }

    #[test]
    fn fallback_servfail_flips_qr_and_rcode_in_place() {
        let query = sample_query("example.com", Rtype::A);
        let raw = query.as_slice().to_vec();
        let reply = fallback_servfail(&query);
        assert_eq!(reply.len(), raw.len());
        assert_eq!(reply_rcode_text(&reply), "SERVFAIL");
    }

    #[test]
    fn synthesize_reply_builds_a_record_for_cloaking_rule() {
        let query = sample_query("www.epicgames.com", Rtype::A);
        let rule = CloakingRule::new("default", "=epicgames.com", "1.1.1.1");
        let reply = synthesize_reply(&query, "www.epicgames.com", Rtype::A, &[&rule]);
        assert_eq!(reply_rcode_text(&reply), "NOERROR");
        let msg = Message::<Bytes>::from_octets(Bytes::from(reply)).unwrap();
        assert_eq!(msg.header_counts().ancount(), 1);
    }

    #[test]
    fn reply_rcode_text_reports_servfail_for_short_buffers() {
        assert_eq!(reply_rcode_text(&[]), "SERVFAIL");
        assert_eq!(reply_rcode_text(&[0, 0]), "SERVFAIL");
    }

    #[test]
    fn filter_answer_ips_is_idempotent() {
        let query = sample_query("example.com", Rtype::A);
        let allowed = CloakingRule::new("default", "example.com", "4.4.4.4");
        let blocked = CloakingRule::new("default", "example.com", "3.3.3.3");
        let reply = synthesize_reply(&query, "example.com", Rtype::A, &[&allowed, &blocked]);

        let mut rule_store = dmatcher::store::RuleStore::new();
        rule_store.insert_blocked_ip(dmatcher::BlockedIp::new("default", "3.3.3.3"));
        let config = Config {
            ipv6_allowed: crate::config::Ipv6Allowed::Unset,
            default: vec![],
            upstreams: hashbrown::HashMap::new(),
            rule_store,
        };

        let once = filter_answer_ips(&reply, "10.0.0.1", &config);
        let twice = filter_answer_ips(&once, "10.0.0.1", &config);
        assert_eq!(once, twice, "re-filtering an already-filtered reply must be a no-op");
    }

    fn mock_upstream() -> Upstream {
        Upstream {
            name: "mock".to_string(),
            addrs: vec!["127.0.0.1".parse().unwrap()],
            ipv4: vec!["127.0.0.1".parse().unwrap()],
            ipv6: vec![],
            preferred_protocol: crate::config::Protocol::Udp,
        }
    }

    async fn test_pipeline(config: Config, dispatch_fn: DispatchFn) -> Pipeline {
        let dir = std::env::temp_dir().join(format!("pipeline-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let (log_sink, _writer) = crate::log_sink::spawn(dir);
        Pipeline::with_dispatch_fn(Arc::new(config), log_sink, Arc::new(reqwest::Client::new()), dispatch_fn)
    }

    #[tokio::test]
    async fn handle_blocks_name_without_ever_calling_dispatch() {
        let mut rule_store = dmatcher::store::RuleStore::new();
        rule_store.insert_blocked_name(dmatcher::BlockedName::new("default", "ads.example.com"));
        let mut upstreams = hashbrown::HashMap::new();
        upstreams.insert("mock".to_string(), mock_upstream());
        let config = Config {
            ipv6_allowed: crate::config::Ipv6Allowed::Unset,
            default: vec!["mock".to_string()],
            upstreams,
            rule_store,
        };

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let dispatch_fn: DispatchFn = Arc::new(move |_u, _f, _q, _c| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async {
                DispatchOutcome {
                    reply: None,
                    server: String::new(),
                    elapsed: std::time::Duration::ZERO,
                    error: None,
                }
            })
        });

        let pipeline = test_pipeline(config, dispatch_fn).await;
        let query = sample_query("ads.example.com", Rtype::A);
        let reply = pipeline
            .handle("10.0.0.1".parse().unwrap(), AddressFamily::V4, query.as_slice())
            .await
            .unwrap();

        assert_eq!(reply_rcode_text(&reply), "REFUSED");
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst), "blocked names must never reach the dispatcher");
    }

    #[tokio::test]
    async fn handle_forwards_through_mock_dispatcher_and_strips_blocked_answer_ip() {
        let mut rule_store = dmatcher::store::RuleStore::new();
        rule_store.insert_blocked_ip(dmatcher::BlockedIp::new("default", "3.3.3.3"));
        let mut upstreams = hashbrown::HashMap::new();
        upstreams.insert("mock".to_string(), mock_upstream());
        let config = Config {
            ipv6_allowed: crate::config::Ipv6Allowed::Unset,
            default: vec!["mock".to_string()],
            upstreams,
            rule_store,
        };

        let dispatch_fn: DispatchFn = Arc::new(|_u, _f, raw_query: &[u8], _c| {
            let msg = Message::<Bytes>::from_octets(Bytes::copy_from_slice(raw_query)).unwrap();
            let rule = CloakingRule::new("default", "example.com", "3.3.3.3");
            let reply = synthesize_reply(&msg, "example.com", Rtype::A, &[&rule]);
            Box::pin(async move {
                DispatchOutcome {
                    reply: Some(reply),
                    server: "mock://127.0.0.1".to_string(),
                    elapsed: std::time::Duration::from_millis(1),
                    error: None,
                }
            })
        });

        let pipeline = test_pipeline(config, dispatch_fn).await;
        let query = sample_query("example.com", Rtype::A);
        let reply = pipeline
            .handle("10.0.0.1".parse().unwrap(), AddressFamily::V4, query.as_slice())
            .await
            .unwrap();

        // The only answer the mock upstream returned is for a blocked IP,
        // so after filtering nothing address-bearing remains.
        assert_eq!(reply_rcode_text(&reply), "REFUSED");
    }

    #[tokio::test]
    async fn handle_forwards_through_mock_dispatcher_and_keeps_allowed_answer_ip() {
        let rule_store = dmatcher::store::RuleStore::new();
        let mut upstreams = hashbrown::HashMap::new();
        upstreams.insert("mock".to_string(), mock_upstream());
        let config = Config {
            ipv6_allowed: crate::config::Ipv6Allowed::Unset,
            default: vec!["mock".to_string()],
            upstreams,
            rule_store,
        };

        let dispatch_fn: DispatchFn = Arc::new(|_u, _f, raw_query: &[u8], _c| {
            let msg = Message::<Bytes>::from_octets(Bytes::copy_from_slice(raw_query)).unwrap();
            let rule = CloakingRule::new("default", "example.com", "4.4.4.4");
            let reply = synthesize_reply(&msg, "example.com", Rtype::A, &[&rule]);
            Box::pin(async move {
                DispatchOutcome {
                    reply: Some(reply),
                    server: "mock://127.0.0.1".to_string(),
                    elapsed: std::time::Duration::from_millis(1),
                    error: None,
                }
            })
        });

        let pipeline = test_pipeline(config, dispatch_fn).await;
        let query = sample_query("example.com", Rtype::A);
        let reply = pipeline
            .handle("10.0.0.1".parse().unwrap(), AddressFamily::V4, query.as_slice())
            .await
            .unwrap();

        assert_eq!(reply_rcode_text(&reply), "NOERROR");
        let msg = Message::<Bytes>::from_octets(Bytes::from(reply)).unwrap();
        assert_eq!(msg.header_counts().ancount(), 1);
    }
}
