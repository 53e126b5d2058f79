/// Relay throughput and invocation parsing benchmarks
///
/// - Invocation parsing: per-call overhead before any data flows
/// - Full sessions through an in-memory mirror, with and without plugins
use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qrexec_proxy::config::{Config, PluginDescriptor};
use qrexec_proxy::error::ConnectError;
use qrexec_proxy::invocation::{InvocationTarget, NextHop};
use qrexec_proxy::plugin::{ChainRegistry, PluginFactory};
use qrexec_proxy::transport::{Connector, ConnectorType, TransportLeg};
use qrexec_proxy::Relay;
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

struct Mirror;

#[async_trait]
impl Connector for Mirror {
    async fn connect(&self, _hop: &NextHop) -> Result<TransportLeg, ConnectError> {
        let (near, far) = duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = w.shutdown().await;
        });
        Ok(TransportLeg::from_stream("mirror", near))
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Custom
    }
}

fn bench_invocation_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("InvocationTarget");

    for argument in ["dst+svc", "audit+dst+svc", "audit+dst+svc+a+b+c"] {
        group.bench_with_input(BenchmarkId::from_parameter(argument), argument, |b, arg| {
            b.iter(|| black_box(InvocationTarget::parse(black_box(arg))))
        });
    }

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("RelaySession");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let config = Config::default()
        .with_chain("pass", vec![PluginDescriptor::new("pass")])
        .with_chain(
            "limit",
            vec![
                PluginDescriptor::new("pass"),
                PluginDescriptor::new("byte_limit")
                    .with_param("outboundLimit", -1)
                    .with_param("inboundLimit", -1)
                    .with_param("totalLimit", -1),
            ],
        );
    let registry = ChainRegistry::from_config(&config, &PluginFactory::with_builtins()).unwrap();
    let relay = Relay::new(registry, Arc::new(Mirror));

    for size in [4 * 1024, 1024 * 1024] {
        let data = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64 * 2));

        for argument in ["dst+mirror", "pass+dst+mirror", "limit+dst+mirror"] {
            let id = BenchmarkId::new(argument, size);
            group.bench_with_input(id, &data, |b, data| {
                b.to_async(&rt).iter(|| async {
                    let (near, mut far) = duplex(64 * 1024);
                    let local = TransportLeg::from_stream("caller", near);
                    let relay = relay.clone();
                    let session = tokio::spawn(async move {
                        relay
                            .serve(argument, "src", local, &CancellationToken::new())
                            .await
                    });

                    let (mut r, mut w) = tokio::io::split(&mut far);
                    let send = async {
                        w.write_all(data).await.unwrap();
                        w.shutdown().await.unwrap();
                    };
                    let mut out = Vec::with_capacity(data.len());
                    let _ = tokio::join!(send, r.read_to_end(&mut out));
                    black_box(session.await.unwrap().exit_code())
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_invocation_parse, bench_session);
criterion_main!(benches);
