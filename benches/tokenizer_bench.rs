// Greedy-merge BPE encode throughput over a synthetic English-ish vocabulary.
// The merge loop is quadratic in the remaining token count, so throughput
// falls off with input length; these sizes bracket realistic prompts.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use glowinfer::tokenizer::Tokenizer;

const INPUT_BYTES: &[usize] = &[64, 256, 1024, 4096];

fn build_tokenizer() -> Tokenizer {
    // single-byte entries for all of ASCII, then common merges with rising scores
    let mut vocab: Vec<Vec<u8>> = (0u8..128).map(|b| vec![b]).collect();
    let mut scores = vec![0.0f32; vocab.len()];
    let merges = [
        "th", "he", "in", "er", "an", "re", "on", "at", "en", "nd", "ti", "es", "or", "te", "of",
        "ed", "is", "it", "al", "ar", "st", "to", "nt", "ng", "se", "ha", "as", "ou", "io", "le",
        "the", "and", "ing", "ent", "ion", "her", "for", "tha", "nth", "int", " th", " an", " to",
        "e t", "d t", " the", " and", "time", "upon", "once",
    ];
    for (i, merge) in merges.iter().enumerate() {
        vocab.push(merge.as_bytes().to_vec());
        scores.push(1.0 + i as f32);
    }
    Tokenizer::from_parts(vocab, scores, 16)
}

fn make_text(target_bytes: usize) -> String {
    let seed = "once upon a time there was a tokenizer that merged the most \
                frequent pairs of adjacent tokens in the prompt and then did \
                it again until nothing was left to merge. ";
    seed.repeat(target_bytes / seed.len() + 1)[..target_bytes].to_string()
}

fn bench_encode(c: &mut Criterion) {
    let tokenizer = build_tokenizer();
    let mut group = c.benchmark_group("bpe_encode");
    for &size in INPUT_BYTES {
        let text = make_text(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &text, |b, text| {
            b.iter(|| tokenizer.encode(black_box(text)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode);
criterion_main!(benches);
