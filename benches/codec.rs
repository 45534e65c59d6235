use criterion::{black_box, criterion_group, criterion_main, Criterion};
use walkie_core::audio::{FrameAssembler, FrameCodec};
use walkie_core::webrtc::SignalingMessage;

fn test_tone(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.05).sin() * 0.6).collect()
}

fn bench_frame_codec(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let frame = test_tone(2048);
    let encoded = codec.encode(&frame);

    c.bench_function("encode_2048_frame", |b| {
        b.iter(|| codec.encode(black_box(&frame)))
    });

    c.bench_function("decode_2048_frame", |b| {
        b.iter(|| codec.decode(black_box(&encoded)).expect("decode frame"))
    });
}

fn bench_audio_message(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let frame = test_tone(2048);

    c.bench_function("audio_message_json_2048", |b| {
        b.iter(|| {
            let message = SignalingMessage::audio(codec.encode_pcm(black_box(&frame)), "bench", 0);
            message.to_json().expect("serialize")
        })
    });
}

fn bench_frame_assembly(c: &mut Criterion) {
    let chunk = test_tone(128);
    let mut assembler = FrameAssembler::new(2048);

    c.bench_function("assemble_128_sample_chunks", |b| {
        b.iter(|| assembler.push(black_box(&chunk)))
    });
}

criterion_group!(benches, bench_frame_codec, bench_audio_message, bench_frame_assembly);
criterion_main!(benches);
