//! Bond Hot-Path Benchmarks
//!
//! Transmit hashing and ownership routing run once per packet or per
//! completion batch.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use xlr_common::XmitHashPolicy;
use xlr_dataplane::bond::{partition_chain, xmit_hash, HashInput, ETH_P_IP};
use xlr_dataplane::{BufferDescriptor, DescChain, RingId};

fn flow(src_port: u16) -> HashInput {
    HashInput {
        src_mac: [0x02, 0, 0, 0, 0, 0x01],
        dst_mac: [0x02, 0, 0, 0, 0, 0x02],
        eth_type: ETH_P_IP,
        encap_type: 0,
        src_ip: 0xC0A8_0101,
        dst_ip: 0x0808_0808,
        src_port,
        dst_port: 443,
    }
}

fn bench_xmit_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("xmit_hash");
    let key = flow(12345);

    for (name, policy) in [
        ("layer2", XmitHashPolicy::Layer2),
        ("layer2_3", XmitHashPolicy::Layer2_3),
        ("layer3_4", XmitHashPolicy::Layer3_4),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| xmit_hash(policy, black_box(&key), black_box(4)))
        });
    }

    group.finish();
}

/// Chain of `len` buffers whose owner changes every `run` buffers
fn chain(members: &[RingId], len: usize, run: usize) -> DescChain {
    (0..len)
        .map(|i| {
            let mut buf = BufferDescriptor::new(i as u32, 64);
            buf.set_owner(Some(members[(i / run) % members.len()]));
            buf
        })
        .collect()
}

fn bench_partition_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_chain");
    let members: Vec<RingId> = (0..4).map(|_| RingId::next()).collect();

    for run in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::new("run", run), &run, |b, &run| {
            b.iter_batched(
                || chain(&members, 256, run),
                |c| black_box(partition_chain(&members, c)),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_xmit_hash, bench_partition_chain);
criterion_main!(benches);
