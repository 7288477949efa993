//! End-to-end recovery of a synthetic math-kernel program hit by packet loss.

use calvados::{
    candidate::CandidateStore,
    corruption::{PacketCorruptor, PacketDescriptor},
    program::{Function, Program},
    recuperator::Recuperator,
    report::SolutionQuality,
    solver::ForwardConstraintEnumerator,
};

/// A 32-word function: two counted loops, a conditional pair, a stack spill and a
/// return. `call_next` swaps the penultimate add for a call into the next function.
fn function_body(call_next: bool) -> Vec<u32> {
    let mut body = vec![
        0xe92d4010, // push {r4, lr}
        0xe3a00000, // mov r0, #0
        0xe3a0100a, // mov r1, #10
        0xe3a02000, // mov r2, #0
        0xe3a03001, // mov r3, #1
        0xe0822003, // add r2, r2, r3
        0xe2800001, // add r0, r0, #1
        0xe1500001, // cmp r0, r1
        0x1afffffb, // bne back to the first add
        0xe3a04019, // mov r4, #25
        0xe0400004, // sub r0, r0, r4
        0xe3500000, // cmp r0, #0
        0x0a000001, // beq over the next two words
        0xe2811001, // add r1, r1, #1
        0xe2822002, // add r2, r2, #2
        0xe0421001, // sub r1, r2, r1
        0xe3520005, // cmp r2, #5
        0x13a0200a, // movne r2, #10
        0x03a02014, // moveq r2, #20
        0xe1520001, // cmp r2, r1
        0xe1a04002, // mov r4, r2
        0xe3540000, // cmp r4, #0
        0x1a000001, // bne over the next two words
        0xe2844001, // add r4, r4, #1
        0xe0800004, // add r0, r0, r4
        0xe58d0000, // str r0, [sp]
        0xe59d0000, // ldr r0, [sp]
        0xe0801001, // add r1, r0, r1
        0xe0812002, // add r2, r1, r2
        0xe1510002, // cmp r1, r2
        0xe0823001, // add r3, r2, r1
        0xe8bd8010, // pop {r4, pc}
    ];
    if call_next {
        body[30] = 0xeb000000; // bl to the next function entry
    }
    body
}

fn basicmath_program() -> Program {
    let mut encodings = Vec::new();
    let mut functions = Vec::new();
    for i in 0..4 {
        let start = encodings.len();
        encodings.extend(function_body(i < 3));
        functions.push(Function::new(format!("f{}", i), start..encodings.len()));
    }
    let instructions = encodings
        .iter()
        .enumerate()
        .map(|(i, e)| calvados::arm::Instruction::new(*e, 0x8000 + (i as u32) * 4))
        .collect();
    Program::new(instructions, functions)
}

#[test]
fn test_one_packet_loss_converges_and_solves() {
    let program = basicmath_program();
    assert_eq!(program.len(), 128);

    let mut store = CandidateStore::from_program(&program);
    let descriptor = PacketDescriptor {
        packet_size_words: 32,
        packets_lost: vec![1],
        candidates_per_address: None,
        seed: Some(42),
    };
    PacketCorruptor::new(descriptor, 4).corrupt(&program, &mut store);

    let corrupted: Vec<u32> = store.corrupted_addresses().collect();
    assert_eq!(corrupted.len(), 32);
    // The corruption model keeps the ground truth in every shortlist.
    let quality = SolutionQuality::measure(&store, &program);
    assert_eq!(quality.present, 32);

    let convergence = Recuperator::new(&program).recover(&mut store);
    assert!(convergence.is_stable());
    assert!(convergence.passes() <= 5);

    // Pruning never empties a candidate list.
    for address in &corrupted {
        assert!(!store.candidates(*address).is_empty());
    }

    let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
    assert!(solution.solution_size >= 1);
    assert_eq!(solution.assignment.len(), 32);
    for (address, instruction) in &solution.assignment {
        assert!(corrupted.contains(address));
        assert!(!instruction.is_undefined());
    }
}

#[test]
fn test_branch_resolution_across_program() {
    let mut encodings = vec![0xe3a00000u32; 24];
    encodings[20] = 0xe12fff1e; // bx lr
    encodings[22] = 0x1afffff7; // bne back to index 15
    let program = Program::from_encodings(0x8000, &encodings);

    let bne = &program.instructions()[22];
    let target = bne.branch_to(&program).unwrap();
    assert_eq!(target.address(), program.instructions()[15].address());

    // Register-indirect branches resolve to nothing statically.
    assert!(program.instructions()[20].branch_to(&program).is_none());
}

#[test]
fn test_zero_corruption_is_a_fixpoint() {
    let program = basicmath_program();
    let mut store = CandidateStore::from_program(&program);

    let convergence = Recuperator::new(&program).recover(&mut store);
    assert!(convergence.is_stable());
    assert_eq!(convergence.passes(), 1);

    for address in store.addresses().collect::<Vec<_>>() {
        let candidates = store.candidates(address);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score(), 1.0);
    }

    let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
    assert!(solution.assignment.is_empty());
    assert_eq!(solution.solution_size, 1);
}

#[test]
fn test_corrupted_boundary_word_is_recovered() {
    let program = basicmath_program();
    let mut store = CandidateStore::from_program(&program);
    // Lose a single word with known neighbours on both sides: the movne at index 17.
    let address = 0x8000 + 17 * 4;
    let truth = program.instruction_at(address).unwrap().encoding();
    let candidates = vec![
        calvados::candidate::Candidate::new(calvados::arm::Instruction::new(truth, address)),
        // A branch nobody asked for: its conditional matches no neighbour and its
        // target is fine, so scoring alone must reject it.
        calvados::candidate::Candidate::new(calvados::arm::Instruction::new(0x2a000001, address)),
    ];
    store.corrupt(address, candidates);

    let convergence = Recuperator::new(&program).recover(&mut store);
    assert!(convergence.is_stable());
    let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
    assert_eq!(solution.assignment[&address].encoding(), truth);
}
