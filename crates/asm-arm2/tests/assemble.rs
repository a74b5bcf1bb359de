//! End-to-end assembly tests: source text in, machine words and
//! diagnostics out.

use asm_arm2::{assemble, MapProvider, Options};
use cpu_arm2::decode;

fn assemble_ok(source: &str) -> asm_arm2::Program {
    let provider = MapProvider::new();
    match assemble(source, "test.s", &provider, &Options::default()) {
        Ok(program) => program,
        Err(diags) => panic!("assembly failed: {diags:#?}"),
    }
}

fn assemble_err(source: &str) -> Vec<asm_arm2::Diagnostic> {
    let provider = MapProvider::new();
    match assemble(source, "test.s", &provider, &Options::default()) {
        Ok(_) => panic!("expected diagnostics"),
        Err(diags) => diags,
    }
}

fn text_words(program: &asm_arm2::Program) -> Vec<u32> {
    program
        .image
        .text
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn known_encodings() {
    let program = assemble_ok(
        "MOV R0, #1\n\
         ADDS R1, R0, R0\n\
         CMP R1, #2\n\
         SWI #0\n",
    );
    assert_eq!(
        text_words(&program),
        vec![0xE3A0_0001, 0xE090_1000, 0xE351_0002, 0xEF00_0000]
    );
    assert_eq!(program.image.text_base, 0x8000);
    assert_eq!(program.image.entry, 0x8000);
}

#[test]
fn entry_follows_start_symbol() {
    let program = assemble_ok("NOP\n_start: NOP\n");
    assert_eq!(program.image.entry, 0x8004);
}

#[test]
fn branches_resolve_forward_and_back() {
    let program = assemble_ok(
        "start: B end\n\
         loop: B loop\n\
         end: B start\n",
    );
    let words = text_words(&program);
    // B end: offset (0x8008 - 0x8000 - 8) >> 2 = 0.
    assert_eq!(words[0], 0xEA00_0000);
    // B loop: to itself = -2.
    assert_eq!(words[1], 0xEAFF_FFFE);
    // B start: (0x8000 - 0x8008 - 8) >> 2 = -4.
    assert_eq!(words[2], 0xEAFF_FFFC);
}

#[test]
fn numeric_labels_pick_nearest() {
    let program = assemble_ok(
        "1: NOP\n\
         B 1b\n\
         B 1f\n\
         1: NOP\n",
    );
    let words = text_words(&program);
    // B 1b at 0x8004 -> 0x8000: offset -3.
    assert_eq!(words[1] & 0x00FF_FFFF, (-3i32 as u32) & 0x00FF_FFFF);
    // B 1f at 0x8008 -> 0x800C: offset -1.
    assert_eq!(words[2] & 0x00FF_FFFF, (-1i32 as u32) & 0x00FF_FFFF);
}

#[test]
fn dot_labels_are_scoped_to_their_function() {
    let program = assemble_ok(
        "first:\n\
         .loop: B .loop\n\
         second:\n\
         .loop: B .loop\n",
    );
    let words = text_words(&program);
    assert_eq!(words[0], 0xEAFF_FFFE);
    assert_eq!(words[1], 0xEAFF_FFFE);
    assert_eq!(program.symbols.address_of("first.loop"), Some(0x8000));
    assert_eq!(program.symbols.address_of("second.loop"), Some(0x8004));
}

#[test]
fn literal_pool_dedup_and_load() {
    let program = assemble_ok(
        "LDR R0, =0x12345678\n\
         LDR R1, =0x12345678\n\
         LDR R2, =0xCAFEBABE\n\
         SWI #0\n",
    );
    let words = text_words(&program);
    assert_eq!(words.len(), 6, "4 instructions + 2 deduplicated literals");
    assert_eq!(words[4], 0x1234_5678);
    assert_eq!(words[5], 0xCAFE_BABE);
    // Both loads of the same constant point at the same slot.
    let w0 = decode(words[0]).unwrap();
    let w1 = decode(words[1]).unwrap();
    match (w0, w1) {
        (
            cpu_arm2::Instruction::LoadStore(cpu_arm2::LoadStore {
                rn: 15,
                offset: cpu_arm2::LsOffset::Imm(o0),
                ..
            }),
            cpu_arm2::Instruction::LoadStore(cpu_arm2::LoadStore {
                rn: 15,
                offset: cpu_arm2::LsOffset::Imm(o1),
                ..
            }),
        ) => {
            // 0x8000+8+o0 == 0x8010 and 0x8004+8+o1 == 0x8010.
            assert_eq!(u32::from(o0), 8);
            assert_eq!(u32::from(o1), 4);
        }
        other => panic!("unexpected decodes: {other:?}"),
    }
}

#[test]
fn ltorg_places_pool_between_routines() {
    let program = assemble_ok(
        "LDR R0, =0xDEADBEEF\n\
         SWI #0\n\
         .ltorg\n\
         after: NOP\n",
    );
    let words = text_words(&program);
    assert_eq!(words[2], 0xDEAD_BEEF);
    assert_eq!(program.symbols.address_of("after"), Some(0x800C));
}

#[test]
fn mov_rewrites_to_mvn_for_inverted_immediates() {
    let program = assemble_ok("MOV R0, #0xFFFFFFFF\nADD R1, R2, #-4\nCMP R3, #-1\n");
    let words = text_words(&program);
    // MVN R0, #0 / SUB R1, R2, #4 / CMN R3, #1.
    assert_eq!(words[0], 0xE3E0_0000);
    assert_eq!(words[1], 0xE242_1004);
    assert_eq!(words[2], 0xE373_0001);
}

#[test]
fn data_and_bss_layout() {
    let program = assemble_ok(
        "LDR R0, =value\n\
         SWI #0\n\
         .data\n\
         value: .word 42\n\
         msg: .asciz \"Hi\\n\"\n\
         .bss\n\
         buffer: .skip 64\n",
    );
    let image = &program.image;
    // Text: 2 instructions + 1 literal.
    assert_eq!(image.text.len(), 12);
    assert_eq!(image.data_base, 0x800C);
    assert_eq!(&image.data[0..4], &42u32.to_le_bytes());
    assert_eq!(&image.data[4..8], b"Hi\n\0");
    assert_eq!(image.bss_size, 64);
    assert_eq!(program.symbols.address_of("buffer"), Some(image.bss_base));
    // The literal pool slot holds value's address.
    let words = text_words(&program);
    assert_eq!(words[2], 0x800C);
}

#[test]
fn equ_chains_and_forward_references() {
    let program = assemble_ok(
        ".equ DOUBLED, BASE * 2\n\
         .equ BASE, 21\n\
         MOV R0, #DOUBLED\n\
         LDR R1, =later\n\
         later: NOP\n",
    );
    let words = text_words(&program);
    assert_eq!(words[0], 0xE3A0_002A);
}

#[test]
fn circular_equ_reported() {
    let diags = assemble_err(".equ A, B\n.equ B, A\nMOV R0, #A\n");
    assert!(diags.iter().any(|d| d.message.contains("circular")), "{diags:?}");
}

#[test]
fn unencodable_immediate_reported() {
    let diags = assemble_err("ADD R0, R1, #0x12345\n");
    assert!(
        diags.iter().any(|d| d.message.contains("cannot be encoded")),
        "{diags:?}"
    );
}

#[test]
fn branch_out_of_range_reported() {
    let diags = assemble_err("B . + 0x4000000\n");
    assert!(diags.iter().any(|d| d.message.contains("range")), "{diags:?}");
}

#[test]
fn undefined_symbol_reported() {
    let diags = assemble_err("B nowhere\n");
    assert!(
        diags.iter().any(|d| d.message.contains("undefined symbol 'nowhere'")),
        "{diags:?}"
    );
}

#[test]
fn duplicate_label_reported_with_original() {
    let diags = assemble_err("x: NOP\nx: NOP\n");
    let dup = diags.iter().find(|d| d.message.contains("duplicate")).expect("duplicate diag");
    assert!(dup.suggestion.as_deref().unwrap_or("").contains("test.s:1"));
}

#[test]
fn errors_accumulate_across_lines() {
    let diags = assemble_err("MOW R0, #1\nADD R0, R1, #0x12345\nB nowhere\n");
    assert!(diags.len() >= 3, "{diags:?}");
}

#[test]
fn alignment_directives() {
    let program = assemble_ok(
        ".data\n\
         .byte 1\n\
         .balign 4\n\
         word: .word 2\n",
    );
    assert_eq!(program.symbols.address_of("word"), Some(program.image.data_base + 4));
    assert_eq!(&program.image.data[4..8], &2u32.to_le_bytes());
}

#[test]
fn org_moves_the_text_base() {
    let program = assemble_ok(".org 0x9000\n_start: NOP\n");
    assert_eq!(program.image.text_base, 0x9000);
    assert_eq!(program.image.entry, 0x9000);
}

#[test]
fn adr_builds_pc_relative_add() {
    let program = assemble_ok("ADR R0, target\nNOP\ntarget: NOP\n");
    let words = text_words(&program);
    // target = 0x8008, pc+8 = 0x8008: ADD R0, PC, #0.
    assert_eq!(words[0], 0xE28F_0000);
}

#[test]
fn include_pulls_in_definitions() {
    let mut provider = MapProvider::new();
    provider.insert("defs.s", ".equ ANSWER, 42\n");
    let program = assemble(
        ".include \"defs.s\"\nMOV R0, #ANSWER\n",
        "main.s",
        &provider,
        &Options::default(),
    )
    .expect("assembles");
    assert_eq!(text_words(&program)[0], 0xE3A0_002A);
}

#[test]
fn macros_assemble_through() {
    let program = assemble_ok(
        ".macro exit code\n\
         MOV R0, #\\code\n\
         SWI #0\n\
         .endm\n\
         exit 3\n",
    );
    assert_eq!(text_words(&program), vec![0xE3A0_0003, 0xEF00_0000]);
}

#[test]
fn register_shifted_register_operand() {
    let program = assemble_ok("ADD R0, R1, R2, LSL R3\n");
    // rs=3, kind LSL, bit4 set: operand 0x0312.
    assert_eq!(text_words(&program)[0], 0xE081_0312);
}

#[test]
fn halfword_and_signed_loads() {
    let program = assemble_ok(
        "LDRH R0, [R1, #0x32]\n\
         LDRSB R2, [R3]\n\
         STRH R4, [R5], #2\n",
    );
    let words = text_words(&program);
    assert_eq!(words[0], 0xE1D1_03B2);
    assert!(matches!(
        decode(words[1]),
        Some(cpu_arm2::Instruction::LoadStoreHalf(cpu_arm2::LoadStoreHalf {
            load: true,
            kind: cpu_arm2::HalfKind::SignedByte,
            ..
        }))
    ));
    assert!(matches!(
        decode(words[2]),
        Some(cpu_arm2::Instruction::LoadStoreHalf(cpu_arm2::LoadStoreHalf {
            load: false,
            pre: false,
            ..
        }))
    ));
}

#[test]
fn push_pop_encode_as_stack_ops() {
    let program = assemble_ok("PUSH {R0-R3}\nPOP {R0-R3}\n");
    let words = text_words(&program);
    assert_eq!(words[0], 0xE92D_000F);
    assert_eq!(words[1], 0xE8BD_000F);
}

#[test]
fn conditionals_gate_code() {
    let program = assemble_ok(
        ".equ DEBUG, 0\n\
         .if DEBUG\n\
         SWI #0xF2\n\
         .endif\n\
         NOP\n",
    );
    assert_eq!(text_words(&program).len(), 1);
}
