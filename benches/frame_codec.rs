use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use livescribe::audio::AudioChunk;
use livescribe::worker::protocol::{encode_frame, read_frame};
use livescribe::worker::{AudioFrame, WorkerInput, WorkerResult};
use std::hint::black_box;
use std::io::Cursor;

/// One audio item carrying `ms` of 16 kHz mono speech-level noise.
fn audio_item(ms: usize) -> WorkerInput {
    let samples: Vec<i16> = (0..16 * ms)
        .map(|i| ((i * 7919) % 16_000) as i16 - 8000)
        .collect();
    WorkerInput::Audio(AudioFrame {
        session_id: Some("0b6c5f0e-4c1d-4f59-9d7e-3a2f1c9e8b70".to_string()),
        chunk: AudioChunk::from_samples(&samples, 16000),
    })
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("audio_frames");
    for ms in [20usize, 100, 500] {
        let item = audio_item(ms);
        let encoded = encode_frame(&item).unwrap_or_default();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", ms), &item, |b, item| {
            b.iter(|| encode_frame(black_box(item)))
        });
        group.bench_with_input(BenchmarkId::new("decode", ms), &encoded, |b, bytes| {
            b.iter(|| read_frame::<_, WorkerInput>(&mut Cursor::new(black_box(bytes.as_slice()))))
        });
    }
    group.finish();

    let result = WorkerResult::transcript("loopback-streaming", "the quick brown fox jumps", true)
        .with_session(Some("0b6c5f0e-4c1d-4f59-9d7e-3a2f1c9e8b70".to_string()))
        .with_latency_ms(12.5);
    c.bench_function("result_frame_roundtrip", |b| {
        b.iter(|| {
            let bytes = encode_frame(black_box(&result)).unwrap_or_default();
            read_frame::<_, WorkerResult>(&mut Cursor::new(bytes))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
