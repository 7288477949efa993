use calvados::{
    arm::Instruction,
    candidate::CandidateStore,
    corruption::{PacketCorruptor, PacketDescriptor},
    program::{Function, Program},
    recuperator::Recuperator,
    solver::ForwardConstraintEnumerator,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn synthetic_program(words: usize) -> Program {
    // Repeating counted-loop body: mov, mov, add, cmp, bne, with a bx lr footer.
    let pattern = [0xe3a00000u32, 0xe3a0100a, 0xe2800001, 0xe1500001, 0x1afffffd];
    let mut encodings: Vec<u32> = (0..words - 1).map(|i| pattern[i % pattern.len()]).collect();
    encodings.push(0xe12fff1e);
    let instructions = encodings
        .iter()
        .enumerate()
        .map(|(i, e)| Instruction::new(*e, 0x8000 + (i as u32) * 4))
        .collect::<Vec<_>>();
    let functions = vec![Function::new("bench", 0..instructions.len())];
    Program::new(instructions, functions)
}

pub fn benchmark(c: &mut Criterion) {
    let mut g = c.benchmark_group("group");
    g.sample_size(20);

    g.bench_function("decode_64k_words", |b| {
        b.iter(|| {
            for encoding in 0..0x10000u32 {
                black_box(Instruction::new(encoding, 0));
            }
        })
    });

    let program = synthetic_program(256);
    g.bench_function("recover_one_packet", |b| {
        b.iter(|| {
            let mut store = CandidateStore::from_program(&program);
            let descriptor = PacketDescriptor {
                packet_size_words: 32,
                packets_lost: vec![2],
                candidates_per_address: None,
                seed: Some(3),
            };
            PacketCorruptor::new(descriptor, 4).corrupt(&program, &mut store);
            Recuperator::new(&program).recover(&mut store);
            black_box(ForwardConstraintEnumerator::new(&program).build(&mut store))
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
