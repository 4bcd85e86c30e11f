use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use binary_session::core::codec::CommandCodec;
use binary_session::core::command::Command;
use binary_session::core::framing::FramingStateMachine;
use tokio_util::codec::Encoder;

#[allow(clippy::unwrap_used)]
fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");
    let payload_sizes = [0usize, 64, 512, 4096, 8192];

    for &size in &payload_sizes {
        let command = Command::new("Benchmark", 0xBEEF, vec![0u8; size]);
        let mut wire = BytesMut::new();
        command.encode(&mut wire).unwrap();

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || command.clone(),
                |command| {
                    let mut buf = BytesMut::with_capacity(size + 32);
                    let mut codec = CommandCodec::new();
                    codec.encode(command, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("parse_{size}b"), |b| {
            b.iter(|| {
                let mut parser = FramingStateMachine::new();
                let (commands, consumed) = parser.parse(&wire).unwrap();
                assert_eq!(commands.len(), 1);
                assert_eq!(consumed, wire.len());
            })
        });
    }

    // Many small frames arriving in one read
    let mut batch = BytesMut::new();
    for i in 0..256u32 {
        Command::new("Tick", i, vec![1u8; 16]).encode(&mut batch).unwrap();
    }
    group.throughput(Throughput::Bytes(batch.len() as u64));
    group.bench_function("parse_256_small_frames", |b| {
        b.iter(|| {
            let mut parser = FramingStateMachine::new();
            let (commands, _) = parser.parse(&batch).unwrap();
            assert_eq!(commands.len(), 256);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_framing);
criterion_main!(benches);
