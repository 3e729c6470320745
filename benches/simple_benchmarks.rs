//! Benchmarks for the request-head parsing and rewriting hot paths

use bifrost_tunnel::request::{ConnectTarget, ForwardRequest, RequestHead};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hyper::{Method, Request, Uri, Version};

const CONNECT_HEAD: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: bench/1.0\r\nProxy-Connection: keep-alive\r\n\r\n";
const GET_HEAD: &[u8] = b"GET http://example.com/index.html?page=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nUser-Agent: bench/1.0\r\nX-Request-Id: 42\r\n\r\n";

/// Benchmark raw request-head parsing
fn bench_request_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_head");

    group.bench_function("parse_connect", |b| {
        b.iter(|| {
            let head = RequestHead::parse(black_box(CONNECT_HEAD));
            black_box(head.ok());
        });
    });

    group.bench_function("parse_absolute_get", |b| {
        b.iter(|| {
            let head = RequestHead::parse(black_box(GET_HEAD));
            black_box(head.ok());
        });
    });

    group.bench_function("parse_partial", |b| {
        let partial = &GET_HEAD[..GET_HEAD.len() / 2];
        b.iter(|| {
            let head = RequestHead::parse(black_box(partial));
            black_box(head.ok());
        });
    });

    group.finish();
}

/// Benchmark CONNECT target validation
fn bench_connect_target(c: &mut Criterion) {
    let mut group = c.benchmark_group("connect_target");

    group.bench_function("hostname", |b| {
        b.iter(|| black_box(ConnectTarget::parse(black_box("example.com:443")).ok()));
    });

    group.bench_function("ipv6", |b| {
        b.iter(|| black_box(ConnectTarget::parse(black_box("[2001:db8::1]:8443")).ok()));
    });

    group.finish();
}

/// Benchmark absolute-form to origin-form rewriting
fn bench_forward_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_rewrite");
    let uri: Uri = "http://example.com:8080/api/items?limit=10".parse().unwrap();

    group.bench_function("from_parts", |b| {
        b.iter(|| {
            black_box(ForwardRequest::from_parts(&Method::GET, black_box(&uri), Version::HTTP_11).ok());
        });
    });

    group.bench_function("rewrite", |b| {
        let forward = ForwardRequest::from_parts(&Method::GET, &uri, Version::HTTP_11).unwrap();
        b.iter(|| {
            let mut req = Request::builder()
                .uri(uri.clone())
                .header("host", "example.com:8080")
                .header("x-custom", "1")
                .body(())
                .unwrap();
            forward.rewrite(&mut req).unwrap();
            black_box(req);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_request_head, bench_connect_target, bench_forward_rewrite);
criterion_main!(benches);
