// Copyright 2025 Cachefront Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end scenarios driving the reply engine against the in-memory
//! store and a scripted origin.

mod utils;

use std::time::Duration;

use http::Method;
use utils::*;

use cachefront::config::ReplyConfig;
use cachefront::key::CacheKey;
use cachefront::meta::{http_date, EntryMeta};
use cachefront::storage::{LookupKind, Storage};
use cachefront::vary::request_variance;
use cachefront::{CollapsedRole, StreamStatus, Tag};

const URI: &str = "http://example.com/a";

#[tokio::test]
async fn test_fresh_hit() {
    let bench = TestBench::new();
    let now = bench.now();
    let resp = build_response(
        200,
        &[
            ("cache-control", "max-age=3600"),
            ("content-length", "9"),
            ("date", &http_date(now - Duration::from_secs(10))),
            ("set-cookie", "secret=1"),
        ],
    );
    let entry = seed_object(bench.store, URI, &resp, b"some body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::Hit);
    assert_eq!(node.status(), 200);
    assert_eq!(node.body, b"some body");
    assert!(node.eof);
    assert_eq!(node.header("age").unwrap(), "10");
    assert!(node.header("date").is_some());
    assert_eq!(node.header("via").unwrap(), "1.1 cache1.test");
    assert_eq!(
        node.header("cache-status").unwrap(),
        "cache1.test;hit;detail=match"
    );
    // hits never leak another user's cookies
    assert!(node.header("set-cookie").is_none());
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
    assert_eq!(ctx.first_lookup_detail(), Some("match"));

    // every subscribe is paired with an unsubscribe
    ctx.detach();
    assert_eq!(entry.readers(), 0);
}

#[tokio::test]
async fn test_stale_revalidation_origin_304() {
    let bench = TestBench::new();
    let now = bench.now();
    let lm = now - Duration::from_secs(9000);
    let entry = seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(
        304,
        &[
            ("date", &http_date(now)),
            ("cache-control", "max-age=3600"),
            ("etag", "\"v1\""),
        ],
        b"",
    ));

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::RefreshUnmodified);
    assert_eq!(node.status(), 200);
    assert_eq!(node.body, b"stale body");
    assert_eq!(bench.origin.fetch_count(), 1);
    // the engine revalidated with the validators of the stale copy
    let seen = bench.origin.seen_lastmod.lock();
    assert_eq!(seen.len(), 1);
    let seen_lm = seen[0].unwrap();
    assert!(seen_lm >= lm - Duration::from_secs(1) && seen_lm <= lm + Duration::from_secs(1));
    assert_eq!(
        bench.origin.seen_etag.lock()[0].as_deref(),
        Some("\"v1\"")
    );
    // the 304 freshened the stored copy in place
    assert!(entry.meta().unwrap().is_fresh(now));
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
}

#[tokio::test]
async fn test_stale_revalidation_client_conditional_gets_304() {
    let bench = TestBench::new();
    let now = bench.now();
    let lm = now - Duration::from_secs(9000);
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(
        304,
        &[("date", &http_date(now)), ("cache-control", "max-age=60")],
        b"",
    ));

    // the client's own conditional is still satisfied after freshening
    let mut ctx = bench.context(build_request(
        "GET",
        URI,
        &[("if-modified-since", &http_date(lm))],
    ));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::RefreshUnmodified);
    assert_eq!(node.status(), 304);
    assert!(node.body.is_empty());
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
}

#[tokio::test]
async fn test_stale_revalidation_origin_new_body() {
    let bench = TestBench::new();
    let now = bench.now();
    let old_entry = seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(
        200,
        &[
            ("date", &http_date(now)),
            ("cache-control", "max-age=3600"),
            ("content-length", "8"),
        ],
        b"new body",
    ));

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::RefreshModified);
    assert_eq!(node.status(), 200);
    assert_eq!(node.body, b"new body");
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);

    // no late delivery from the replaced object's subscription
    ctx.detach();
    assert_eq!(old_entry.readers(), 0);

    // the fresh object replaced the stale one in the store
    let key = CacheKey::new(&Method::GET, URI);
    let replaced = bench
        .store
        .lookup(&key, LookupKind::Public)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.object_len(), 8);

    // and a second client hits it without another fetch
    let mut ctx2 = bench.context(build_request("GET", URI, &[]));
    let mut node2 = CollectorNode::new();
    ctx2.get_more_data(&mut node2).await.unwrap();
    assert_eq!(ctx2.tag(), Tag::Hit);
    assert_eq!(node2.body, b"new body");
    assert_eq!(bench.origin.fetch_count(), 1);
}

#[tokio::test]
async fn test_stale_revalidation_origin_older_date_ignored() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    // "newer" reply from the origin is actually older by its Date header
    bench.origin.push(CannedReply::new(
        200,
        &[
            ("date", &http_date(now - Duration::from_secs(900))),
            ("content-length", "8"),
        ],
        b"old body",
    ));

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.body, b"stale body");
    assert!(ctx.ignored_stale_reply());
    assert_eq!(ctx.tag(), Tag::Refresh);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_collapsed_revalidation() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(
        CannedReply::new(
            304,
            &[("date", &http_date(now)), ("cache-control", "max-age=60")],
            b"",
        )
        .delayed(Duration::from_millis(100)),
    );

    let mut ctx1 = bench.context(build_request("GET", URI, &[]));
    let mut ctx2 = bench.context(build_request("GET", URI, &[]));
    let mut ctx3 = bench.context(build_request("GET", URI, &[]));
    let mut n1 = CollectorNode::new();
    let mut n2 = CollectorNode::new();
    let mut n3 = CollectorNode::new();

    let (r1, r2, r3) = tokio::join!(
        ctx1.get_more_data(&mut n1),
        ctx2.get_more_data(&mut n2),
        ctx3.get_more_data(&mut n3),
    );
    r1.unwrap();
    r2.unwrap();
    r3.unwrap();

    // exactly one upstream fetch was started for the three revalidators
    assert_eq!(bench.origin.fetch_count(), 1);
    for node in [&n1, &n2, &n3] {
        assert_eq!(node.status(), 200);
        assert_eq!(node.body, b"stale body");
    }
    let roles = [
        ctx1.collapsed_role(),
        ctx2.collapsed_role(),
        ctx3.collapsed_role(),
    ];
    assert_eq!(
        roles
            .iter()
            .filter(|r| **r == CollapsedRole::Initiator)
            .count(),
        1
    );
    assert_eq!(
        roles.iter().filter(|r| **r == CollapsedRole::Slave).count(),
        2
    );
}

#[tokio::test]
async fn test_only_if_cached_miss() {
    let bench = TestBench::new();
    let mut ctx = bench.context(build_request(
        "GET",
        "http://example.com/c",
        &[("cache-control", "only-if-cached")],
    ));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 504);
    assert!(node.eof);
    // no forwarding happened
    assert_eq!(bench.origin.fetch_count(), 0);
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
}

#[tokio::test]
async fn test_purge_evicts_both_variants() {
    let config =
        ReplyConfig::from_yaml("hostname: cache1.test\nenable_purge: true").unwrap();
    let bench = TestBench::new().with_config(config);
    let now = bench.now();
    let neighbors = NeighborRecorder::new();
    let ip_cache = IpCacheRecorder::new();

    seed_object(bench.store, URI, &bench.fresh_response(4), b"getb", now);
    let head_key = CacheKey::new(&Method::HEAD, URI);
    bench.store.seed(
        &head_key,
        EntryMeta::from_response(&bench.fresh_response(0), now, None),
        b"",
    );
    assert_eq!(bench.store.len(), 2);

    let mut ctx = bench
        .context(build_request("PURGE", URI, &[]))
        .with_neighbors(neighbors.clone())
        .with_ip_cache(ip_cache.clone());
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 200);
    assert_eq!(bench.store.len(), 0);
    assert_eq!(*ip_cache.invalidated.lock(), ["example.com"]);
    let cleared = neighbors.cleared.lock();
    assert_eq!(cleared.len(), 2);
    assert!(cleared
        .iter()
        .all(|(_, _, reason)| matches!(reason, cachefront::access::ClearReason::Purge)));
    assert_eq!(cleared[0].1, "GET");
    assert_eq!(cleared[1].1, "HEAD");
}

#[tokio::test]
async fn test_purge_not_found() {
    let config =
        ReplyConfig::from_yaml("hostname: cache1.test\nenable_purge: true").unwrap();
    let bench = TestBench::new().with_config(config);
    let mut ctx = bench.context(build_request("PURGE", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 404);
}

#[tokio::test]
async fn test_purge_disabled() {
    let bench = TestBench::new(); // enable_purge defaults to off
    let mut ctx = bench.context(build_request("PURGE", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 403);
    assert_eq!(ctx.tag(), Tag::Denied);
    assert_eq!(bench.store.len(), 0);
}

#[tokio::test]
async fn test_vary_mismatch_then_variant_hit() {
    let bench = TestBench::new();
    let now = bench.now();

    let vary_resp = |variant: &str, len: usize| {
        build_response(
            200,
            &[
                ("cache-control", "max-age=3600"),
                ("content-length", &len.to_string()),
                ("date", &http_date(now)),
                ("vary", "Accept-Encoding"),
                ("content-encoding", variant),
            ],
        )
    };

    let variance_of = |encoding: &str| {
        let mut headers = http::HeaderMap::new();
        headers.insert("accept-encoding", encoding.parse().unwrap());
        request_variance("Accept-Encoding", &headers)
            .unwrap()
            .0
            .unwrap()
    };

    // the primary slot holds the gzip variant
    let base_key = CacheKey::new(&Method::GET, URI);
    let mut meta_a = EntryMeta::from_response(&vary_resp("gzip", 9), now, None);
    meta_a.set_variance(variance_of("gzip"));
    bench.store.seed(&base_key, meta_a, b"gzip body");

    // the br variant lives in a secondary slot
    let mut br_key = CacheKey::new(&Method::GET, URI);
    br_key.set_variance_key(variance_of("br"));
    let mut meta_b = EntryMeta::from_response(&vary_resp("br", 7), now, None);
    meta_b.set_variance(variance_of("br"));
    bench.store.seed(&br_key, meta_b, b"br body");

    let mut ctx = bench.context(build_request("GET", URI, &[("accept-encoding", "br")]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::Hit);
    assert_eq!(node.body, b"br body");
    // the requery does not overwrite the first lookup's classification
    assert_eq!(ctx.first_lookup_detail(), Some("match"));
    assert_eq!(bench.origin.fetch_count(), 0);

    // an uncached variant falls through to a miss
    let mut ctx2 = bench.context(build_request(
        "GET",
        URI,
        &[("accept-encoding", "identity")],
    ));
    let mut node2 = CollectorNode::new();
    ctx2.get_more_data(&mut node2).await.unwrap();
    assert_eq!(ctx2.tag(), Tag::Miss);
    assert_eq!(bench.origin.fetch_count(), 1);
}

#[tokio::test]
async fn test_conditional_if_none_match() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    // matching strong etag: 304 with an empty body
    let mut ctx = bench.context(build_request("GET", URI, &[("if-none-match", "\"v1\"")]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 304);
    assert!(node.body.is_empty());
    assert_eq!(ctx.tag(), Tag::InmHit);
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);

    // non-matching etag: the full stored body
    let mut ctx2 = bench.context(build_request("GET", URI, &[("if-none-match", "\"zzz\"")]));
    let mut node2 = CollectorNode::new();
    ctx2.get_more_data(&mut node2).await.unwrap();
    assert_eq!(node2.status(), 200);
    assert_eq!(node2.body, b"full body");
    assert_eq!(ctx2.tag(), Tag::Hit);
}

#[tokio::test]
async fn test_conditional_if_modified_since() {
    let bench = TestBench::new();
    let now = bench.now();
    let lm = now - Duration::from_secs(9000);
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    let mut ctx = bench.context(build_request(
        "GET",
        URI,
        &[("if-modified-since", &http_date(lm))],
    ));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 304);
    assert_eq!(ctx.tag(), Tag::ImsHit);
    // 304 never carries entity headers the client cannot use
    assert!(node.header("content-length").is_none());

    // modified since the given time: unconditional hit
    let mut ctx2 = bench.context(build_request(
        "GET",
        URI,
        &[(
            "if-modified-since",
            &http_date(lm - Duration::from_secs(3600)),
        )],
    ));
    let mut node2 = CollectorNode::new();
    ctx2.get_more_data(&mut node2).await.unwrap();
    assert_eq!(node2.status(), 200);
    assert_eq!(node2.body, b"full body");
}

#[tokio::test]
async fn test_conditional_if_match_fails() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[("if-match", "\"other\"")]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 412);
    assert!(node.body.is_empty());
}

#[tokio::test]
async fn test_revalidation_fail_serves_stale() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(200, &[], b"").failing());

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::RefreshFailOld);
    assert_eq!(node.status(), 200);
    assert_eq!(node.body, b"stale body");
}

#[tokio::test]
async fn test_revalidation_5xx_policy() {
    // default: serve stale on origin errors
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(
        500,
        &[("date", &http_date(now)), ("content-length", "5")],
        b"whoop",
    ));

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(ctx.tag(), Tag::RefreshFailOld);
    assert_eq!(node.body, b"stale body");

    // fail_on_validation_err forwards the origin error instead
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);
    bench.origin.push(CannedReply::new(
        500,
        &[("date", &http_date(now)), ("content-length", "5")],
        b"whoop",
    ));

    let mut request = build_request("GET", URI, &[]);
    request.flags.fail_on_validation_err = true;
    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(ctx.tag(), Tag::RefreshFailErr);
    assert_eq!(node.status(), 500);
    assert_eq!(node.body, b"whoop");
}

#[tokio::test]
async fn test_client_no_cache_skips_lookup() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);
    let ip_cache = IpCacheRecorder::new();
    bench.origin.push(CannedReply::new(
        200,
        &[("content-length", "5"), ("date", &http_date(now))],
        b"fresh",
    ));

    let mut ctx = bench
        .context(build_request("GET", URI, &[("cache-control", "no-cache")]))
        .with_ip_cache(ip_cache.clone());
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    // external no-cache skips the store lookup entirely
    assert_eq!(ctx.tag(), Tag::Miss);
    assert_eq!(node.body, b"fresh");
    assert_eq!(bench.origin.fetch_count(), 1);
    assert_eq!(ctx.first_lookup_detail(), Some("no-cache"));
    assert_eq!(*ip_cache.negative.lock(), ["example.com"]);
    assert_eq!(
        node.header("cache-status").unwrap(),
        "cache1.test;fwd=miss;detail=no-cache"
    );
}

#[tokio::test]
async fn test_internal_no_cache_refresh_miss() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);
    bench.origin.push(CannedReply::new(
        200,
        &[("content-length", "5"), ("date", &http_date(now))],
        b"fresh",
    ));

    // internally generated reloads still look up, then refuse the hit
    let mut request = build_request("GET", URI, &[("cache-control", "no-cache")]);
    request.flags.internal = true;
    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::ClientRefreshMiss);
    assert_eq!(node.body, b"fresh");
    assert_eq!(ctx.first_lookup_detail(), Some("match"));
}

#[tokio::test]
async fn test_negative_hit() {
    let bench = TestBench::new();
    let now = bench.now();
    let resp = build_response(
        404,
        &[
            ("cache-control", "max-age=60"),
            ("content-length", "9"),
            ("date", &http_date(now)),
        ],
    );
    seed_object(bench.store, URI, &resp, b"not found", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::NegativeHit);
    assert_eq!(node.status(), 404);
    assert_eq!(node.body, b"not found");
    // P4: hits carry Date and a non-negative Age
    assert!(node.header("date").is_some());
    assert!(node.header("age").unwrap().parse::<u64>().is_ok());
}

#[tokio::test]
async fn test_offline_serves_stale() {
    let config = ReplyConfig::from_yaml("hostname: cache1.test\noffline: true").unwrap();
    let bench = TestBench::new().with_config(config);
    let now = bench.now();
    seed_object(bench.store, URI, &bench.stale_response(10), b"stale body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::OfflineHit);
    assert_eq!(node.body, b"stale body");
    assert_eq!(bench.origin.fetch_count(), 0);
}

#[tokio::test]
async fn test_miss_keeps_set_cookie_and_chunks_unknown_length() {
    let bench = TestBench::new();
    let now = bench.now();
    // no content-length on the origin reply
    bench.origin.push(CannedReply::new(
        200,
        &[("date", &http_date(now)), ("set-cookie", "sid=1")],
        b"streamed body",
    ));

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::Miss);
    assert_eq!(node.body, b"streamed body");
    // misses pass Set-Cookie along unmodified
    assert_eq!(node.header("set-cookie").unwrap(), "sid=1");
    // P6: unknown body size on a HTTP/1.1 client means chunked
    assert_eq!(node.header("transfer-encoding").unwrap(), "chunked");
    assert!(ctx.request().flags.chunked_reply);
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);

    // with a declared length there is no chunking
    let bench = TestBench::new();
    bench.origin.push(CannedReply::new(
        200,
        &[("date", &http_date(now)), ("content-length", "4")],
        b"sized",
    ));
    // deliberately broken origin: declared 4, sent 5
    let mut ctx = bench.context(build_request("GET", "http://example.com/b", &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert!(node.header("transfer-encoding").is_none());
    // the truncation reaches the next node as a stream error, never as a
    // clean end of body
    assert!(!node.errors.is_empty());
    assert!(!node.eof);
    // and the length mismatch is an unplanned completion
    assert_eq!(ctx.reply_status(), StreamStatus::UnplannedComplete);
}

#[tokio::test]
async fn test_no_cache_hack_bypasses_negative_hit() {
    let bench = TestBench::new();
    let now = bench.now();
    let resp = build_response(
        404,
        &[
            ("cache-control", "max-age=60"),
            ("content-length", "9"),
            ("date", &http_date(now)),
        ],
    );
    seed_object(bench.store, URI, &resp, b"not found", now);

    let mut request = build_request("GET", URI, &[]);
    request.flags.no_cache_hack = true;
    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    // the cached error is not served as a negative hit when the front end
    // rewrote the client's reload
    assert_eq!(ctx.tag(), Tag::Hit);
    assert_eq!(node.status(), 404);
    assert_eq!(node.body, b"not found");
}

#[tokio::test]
async fn test_connection_header_exactly_one_decision() {
    // P7: keep-alive xor close on every finished reply
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    let decisions: Vec<String> = node
        .header_all("connection")
        .iter()
        .filter(|v| *v == "keep-alive" || *v == "close")
        .cloned()
        .collect();
    assert_eq!(decisions, ["keep-alive"]);

    // errors close when error_pconns is off
    let config =
        ReplyConfig::from_yaml("hostname: cache1.test\nerror_pconns: false").unwrap();
    let bench = TestBench::new().with_config(config);
    let mut ctx = bench.context(build_request("PURGE", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 403);
    let decisions: Vec<String> = node
        .header_all("connection")
        .iter()
        .filter(|v| *v == "keep-alive" || *v == "close")
        .cloned()
        .collect();
    assert_eq!(decisions, ["close"]);
    assert!(!ctx.request().flags.proxy_keepalive);
}

#[tokio::test]
async fn test_reply_access_denied() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    let mut ctx = bench
        .context(build_request("GET", URI, &[]))
        .with_reply_access(std::sync::Arc::new(DenyAllReplies));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 403);
    assert!(node.body.is_empty());
    assert_eq!(ctx.tag(), Tag::DeniedReply);
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
}

#[tokio::test]
async fn test_send_hit_gate_forces_miss() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);
    bench.origin.push(CannedReply::new(
        200,
        &[("content-length", "5"), ("date", &http_date(now))],
        b"fresh",
    ));

    let mut ctx = bench
        .context(build_request("GET", URI, &[]))
        .with_hit_access(std::sync::Arc::new(BlockAllHits));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::Miss);
    assert_eq!(node.body, b"fresh");
    assert_eq!(bench.origin.fetch_count(), 1);
}

#[tokio::test]
async fn test_loop_detected_403() {
    let bench = TestBench::new();
    let mut request = build_request("GET", URI, &[]);
    request.flags.loop_detected = true;
    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 403);
    assert_eq!(bench.origin.fetch_count(), 0);
}

#[tokio::test]
async fn test_redirect_shortcut() {
    let bench = TestBench::new();
    let mut request = build_request("GET", URI, &[]);
    request.redirect = Some(cachefront::request::Redirect {
        status: http::StatusCode::MOVED_PERMANENTLY,
        location: "http://example.com/b".to_string(),
    });
    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(ctx.tag(), Tag::Redirect);
    assert_eq!(node.status(), 301);
    assert_eq!(node.header("location").unwrap(), "http://example.com/b");
    assert_eq!(bench.origin.fetch_count(), 0);
}

#[tokio::test]
async fn test_trace_max_forwards_zero() {
    let bench = TestBench::new();
    let mut ctx = bench.context(build_request(
        "TRACE",
        URI,
        &[("max-forwards", "0"), ("x-marker", "yes")],
    ));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 200);
    assert_eq!(node.header("content-type").unwrap(), "message/http");
    let body = String::from_utf8(node.body.clone()).unwrap();
    assert!(body.starts_with("TRACE http://example.com/a"));
    assert!(body.contains("x-marker: yes"));
    assert_eq!(bench.origin.fetch_count(), 0);
}

#[tokio::test]
async fn test_body_too_large_up_front() {
    let config = ReplyConfig::from_yaml(
        "hostname: cache1.test\nmax_reply_body_size: 4",
    )
    .unwrap();
    let bench = TestBench::new().with_config(config);
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();
    assert_eq!(node.status(), 403);
    assert_eq!(ctx.tag(), Tag::DeniedReply);
}

#[tokio::test]
async fn test_body_too_large_mid_stream() {
    let config = ReplyConfig::from_yaml(
        "hostname: cache1.test\nmax_reply_body_size: 4",
    )
    .unwrap();
    let bench = TestBench::new().with_config(config);
    let now = bench.now();
    // no declared length, so the cap can only trip mid-stream
    let resp = build_response(
        200,
        &[("cache-control", "max-age=3600"), ("date", &http_date(now))],
    );
    seed_object(bench.store, URI, &resp, b"way too much body", now);

    let mut ctx = bench.context(build_request("GET", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert!(!node.errors.is_empty());
    assert!(!node.eof);
    assert_eq!(ctx.reply_status(), StreamStatus::Failed);
}

#[tokio::test]
async fn test_unsafe_method_invalidates_variants() {
    let bench = TestBench::new();
    let now = bench.now();
    seed_object(bench.store, URI, &bench.fresh_response(4), b"getb", now);
    let neighbors = NeighborRecorder::new();
    bench.origin.push(CannedReply::new(
        200,
        &[("content-length", "4"), ("date", &http_date(now))],
        b"done",
    ));

    let mut ctx = bench
        .context(build_request("DELETE", URI, &[]))
        .with_neighbors(neighbors.clone());
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 200);
    // the GET variant is gone
    assert_eq!(bench.store.len(), 0);
    let cleared = neighbors.cleared.lock();
    assert_eq!(cleared.len(), 2);
    assert!(cleared
        .iter()
        .all(|(_, _, reason)| matches!(reason, cachefront::access::ClearReason::Invalidation)));
}

#[tokio::test]
async fn test_head_sends_no_body() {
    let bench = TestBench::new();
    let now = bench.now();
    let key = CacheKey::new(&Method::HEAD, URI);
    let mut resp = bench.fresh_response(9);
    resp.insert_header("content-length", "9").unwrap();
    bench
        .store
        .seed(&key, EntryMeta::from_response(&resp, now, None), b"full body");

    let mut ctx = bench.context(build_request("HEAD", URI, &[]));
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    assert_eq!(node.status(), 200);
    assert!(node.body.is_empty());
    assert!(node.eof);
    assert_eq!(ctx.reply_status(), StreamStatus::Complete);
}

#[tokio::test]
async fn test_client_disconnect_mid_stream() {
    let bench = TestBench::new();
    let now = bench.now();
    let request = build_request("GET", URI, &[]);
    let conn = request.conn().unwrap().clone();
    seed_object(bench.store, URI, &bench.fresh_response(9), b"full body", now);
    conn.close();

    let mut ctx = bench.context(request);
    let mut node = CollectorNode::new();
    ctx.get_more_data(&mut node).await.unwrap();

    // silent stop: nothing was delivered, no error raised
    assert!(node.reply.is_none());
    assert!(node.errors.is_empty());
}
