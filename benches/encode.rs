use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use unipiece::{Piece, UnigramModel};

fn build_model() -> UnigramModel {
    let mut pieces = vec![
        Piece::unknown("<unk>"),
        Piece::control("<s>"),
        Piece::control("</s>"),
    ];
    // Single characters plus frequent bigrams and words.
    for (i, c) in "▁abcdefghijklmnopqrstuvwxyz".chars().enumerate() {
        pieces.push(Piece::normal(c.to_string(), -8.0 - i as f32 * 0.01));
    }
    for (i, word) in ["▁the", "▁of", "▁and", "▁to", "▁in", "th", "he", "an", "er", "on"]
        .iter()
        .enumerate()
    {
        pieces.push(Piece::normal((*word).to_string(), -4.0 - i as f32 * 0.1));
    }
    UnigramModel::new(pieces).expect("valid model")
}

fn build_input() -> String {
    let sentence = "▁the▁quick▁brown▁fox▁jumps▁over▁the▁lazy▁dog▁and▁then▁onto▁another";
    sentence.repeat(16)
}

fn bench_encode(c: &mut Criterion) {
    let model = build_model();
    let input = build_input();

    let mut group = c.benchmark_group("unigram_encode");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function(BenchmarkId::from_parameter("viterbi"), |b| {
        b.iter(|| {
            let pieces = model.encode(black_box(&input));
            let _ = black_box(pieces);
        });
    });
    group.bench_function(BenchmarkId::from_parameter("nbest_4"), |b| {
        b.iter(|| {
            let paths = model.nbest_encode(black_box(&input), 4);
            let _ = black_box(paths);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
