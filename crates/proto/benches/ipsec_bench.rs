//! IKE Engine Performance Benchmarks
//!
//! Benchmarks for payload codec, Child SA lookups, SPI routing and a full
//! in-memory IKE_SA_INIT + IKE_AUTH handshake.
//!
//! Run with: `cargo bench --features ipsec --bench ipsec_bench`

#![cfg(feature = "ipsec")]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ike_proto::ipsec::{
    child_sa::{ChildSa, ChildSaRegistry, IpsecMode, IpsecProtocol},
    context::EngineContext,
    directory::DispatchOutcome,
    ike_sa::{ChildSaRequest, Command},
    ikev2::{
        id::{IdPayload, IdTemplate, Identity},
        payload::PayloadCodec,
        proposal::{
            DhTransformId, EncrTransformId, IntegTransformId, PrfTransformId, Proposal,
            ProtocolId, Transform,
        },
        IkeMessage,
    },
    policy::{Authenticator, GeneralConfiguration, IkeSaConfiguration, PeerConfiguration, Role},
};
use std::net::IpAddr;

/// Create test IKE proposal
fn create_test_ike_proposal() -> Proposal {
    Proposal::new(1, ProtocolId::Ike)
        .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
        .add_transform(Transform::prf(PrfTransformId::HmacSha256))
        .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
        .add_transform(Transform::dh(DhTransformId::Group14))
}

fn create_test_context(prefix: &str, role: Role, my_id: &str) -> EngineContext {
    let ctx = EngineContext::new(GeneralConfiguration::default());
    ctx.policy()
        .add_peer_configuration(PeerConfiguration::new(
            prefix.parse().unwrap(),
            role,
            IkeSaConfiguration::new(Identity::fqdn(my_id), Authenticator::psk(b"bench secret"))
                .with_proposal(create_test_ike_proposal())
                .allow_id(IdTemplate::Any),
        ))
        .unwrap();
    ctx
}

/// Benchmark ID payload encoding and decoding
fn bench_id_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_payload");

    let payload = IdPayload::new(Identity::fqdn("gateway.corp.example"));
    let wire = payload.to_bytes().unwrap();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("encode", |b| b.iter(|| black_box(payload.to_bytes())));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(IdPayload::from_bytes(black_box(&wire)).unwrap()))
    });

    group.finish();
}

/// Benchmark full message decoding
fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ike_message");

    let initiator = create_test_context("198.51.100.0/24", Role::Initiator, "client.example");
    let spi = initiator
        .request_child_sa(
            "192.0.2.1".parse().unwrap(),
            "198.51.100.7".parse().unwrap(),
            ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
        )
        .unwrap();
    let init = initiator.run_ike_sa(spi).remove(0);
    group.throughput(Throughput::Bytes(init.bytes.len() as u64));

    group.bench_function("decode_ike_sa_init", |b| {
        b.iter(|| black_box(IkeMessage::decode(black_box(&init.bytes)).unwrap()))
    });

    group.finish();
}

/// Benchmark dual-index Child SA lookups
fn bench_child_sa_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("child_sa_registry");

    for size in [16u32, 1024] {
        let registry = ChildSaRegistry::new();
        for n in 0..size {
            registry.add(ChildSa::new(
                0x1000 + n,
                0x8000_0000 + n,
                IpsecProtocol::Esp,
                IpsecMode::Tunnel,
            ));
        }
        let inbound = 0x1000 + size / 2;
        let outbound = 0x8000_0000 + size / 2;

        group.bench_with_input(BenchmarkId::new("by_inbound", size), &inbound, |b, spi| {
            b.iter(|| black_box(registry.get(*spi)))
        });
        group.bench_with_input(BenchmarkId::new("by_outbound", size), &outbound, |b, spi| {
            b.iter(|| black_box(registry.get(*spi)))
        });
    }

    group.finish();
}

/// Benchmark command routing through the directory
fn bench_directory_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory");

    let ctx = create_test_context("0.0.0.0/0", Role::Initiator, "client.example");
    let local: IpAddr = "192.0.2.1".parse().unwrap();
    let mut spis = Vec::new();
    for n in 0..256u32 {
        let peer = IpAddr::from([10, 0, (n >> 8) as u8, n as u8]);
        let spi = ctx
            .request_child_sa(
                local,
                peer,
                ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
            )
            .unwrap();
        spis.push(spi);
    }
    let target = spis[128];

    group.bench_function("lookup_by_ike_sa_spi", |b| {
        b.iter(|| black_box(ctx.directory().get_by_ike_sa_spi(black_box(target))))
    });
    group.bench_function("push_command", |b| {
        b.iter(|| {
            ctx.directory()
                .push_command_by_ike_sa_spi(target, Command::Liveness, false)
        })
    });

    group.finish();
}

/// Benchmark a complete handshake between two contexts
fn bench_full_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");
    group.sample_size(50);

    let i_addr: IpAddr = "192.0.2.1".parse().unwrap();
    let r_addr: IpAddr = "198.51.100.7".parse().unwrap();

    group.bench_function("init_and_auth", |b| {
        b.iter(|| {
            let i = create_test_context("198.51.100.0/24", Role::Initiator, "client.example");
            let r = create_test_context("192.0.2.0/24", Role::Responder, "gw.example");

            let spi = i
                .request_child_sa(
                    i_addr,
                    r_addr,
                    ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
                )
                .unwrap();
            let mut to_r = i.run_ike_sa(spi);
            while let Some(message) = to_r.pop() {
                let spi_r = match r.dispatch_datagram(&message.bytes, i_addr, r_addr) {
                    DispatchOutcome::Queued(spi_r) => spi_r,
                    _ => break,
                };
                for reply in r.run_ike_sa(spi_r) {
                    if let DispatchOutcome::Queued(spi_i) =
                        i.dispatch_datagram(&reply.bytes, r_addr, i_addr)
                    {
                        to_r.extend(i.run_ike_sa(spi_i));
                    }
                }
            }
            black_box(i.metrics_snapshot().ike_sa_established)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_id_payload,
    bench_message_decode,
    bench_child_sa_lookup,
    bench_directory_routing,
    bench_full_handshake,
);

criterion_main!(benches);
