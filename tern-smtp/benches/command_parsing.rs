//! Benchmarks for the hot paths of an SMTP session
//!
//! - Command parsing, with and without ESMTP parameters
//! - Message body collection
//! - Multi-line reply parsing on the client side
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tern_smtp::{
    body::BodyCollector,
    client::{Response, encode_body},
    command::{Command, MailParameters},
};

fn bench_command_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_parsing");

    let commands = vec![
        ("QUIT", "quit"),
        ("EHLO mail.example.com", "ehlo"),
        ("MAIL FROM:<user@example.com>", "mail"),
        (
            "MAIL FROM:<user@example.com> SIZE=12345 BODY=8BITMIME ENVID=abc+2Bdef RET=HDRS",
            "mail_with_params",
        ),
        ("MAIL FROM:<>", "null_sender"),
        ("RCPT TO:<recipient@example.com>", "rcpt"),
        (
            "RCPT TO:<recipient@example.com> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;recipient@example.com",
            "rcpt_with_params",
        ),
        ("XYZZY plugh", "unknown"),
    ];

    for (line, desc) in commands {
        group.throughput(Throughput::Bytes(line.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(desc), &line, |b, &line| {
            b.iter(|| black_box(Command::parse(black_box(line))));
        });
    }

    group.finish();
}

fn bench_mail_parameters(c: &mut Criterion) {
    let mut group = c.benchmark_group("mail_parameters");

    for (params, desc) in [
        ("SIZE=12345", "single"),
        ("SIZE=12345 BODY=8BITMIME AUTH=<>", "three"),
        ("size=12345 body=8bitmime ret=full envid=x+2By", "lowercase"),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(desc), &params, |b, &params| {
            b.iter(|| black_box(MailParameters::parse(black_box(params))));
        });
    }

    group.finish();
}

fn bench_body_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_collection");

    for lines in [10usize, 1_000] {
        let body = (0..lines)
            .map(|i| {
                if i % 7 == 0 {
                    format!("..stuffed line {i}\r\n")
                } else {
                    format!("an ordinary line of text number {i}\r\n")
                }
            })
            .collect::<Vec<_>>();
        let bytes = body.iter().map(String::len).sum::<usize>();

        group.throughput(Throughput::Bytes(bytes as u64));
        group.bench_with_input(BenchmarkId::new("collect", lines), &body, |b, body| {
            b.iter(|| {
                let mut collector = BodyCollector::new(0);
                for line in body {
                    collector.push_line(line.as_bytes());
                }
                collector.push_line(b".\r\n");
                black_box(collector.finish().unwrap())
            });
        });

        let joined = body.concat();
        group.bench_with_input(BenchmarkId::new("encode", lines), &joined, |b, joined| {
            b.iter(|| black_box(encode_body(black_box(joined.as_bytes()))));
        });
    }

    group.finish();
}

fn bench_reply_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_parsing");

    let replies = [
        ("250 2.1.5 Recipient ok\r\n", "single"),
        (
            "250-mx.example.com Hello\r\n250-PIPELINING\r\n250-SIZE 10240000\r\n250-DSN\r\n\
             250-8BITMIME\r\n250-STARTTLS\r\n250-AUTH PLAIN LOGIN\r\n250 ENHANCEDSTATUSCODES\r\n",
            "ehlo",
        ),
    ];

    for (reply, desc) in replies {
        group.throughput(Throughput::Bytes(reply.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(desc), &reply, |b, &reply| {
            b.iter(|| black_box(Response::parse_response(black_box(reply.as_bytes())).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_parsing,
    bench_mail_parameters,
    bench_body_collection,
    bench_reply_parsing,
);
criterion_main!(benches);
