//! ARM A32 code generation. Fixed-width 32-bit instructions, emitted
//! little-endian.
//!
//! Only caller-saved registers are used, so the preamble has nothing
//! to preserve for the caller:
//!
//! - r0..r3 -> r0, r1, r2, r3
//! - r12    -> base data pointer / environment
//! - r14    -> temporary
//!
//! A fake link register is pushed before each `Call` branch, emulating
//! the x86 call scheme; `Return` is then simply `pop {pc}` no matter
//! how deep it executes.

use super::{CallOutThunk, LabelMap, NativeBackend, callout_thunk};
use crate::vm::{CallOutFunc, Label, NUM_REGISTERS, Op, Register, VmError, VmResult};

pub(crate) struct A32Backend;

impl NativeBackend for A32Backend {
    const WORD_SIZE: usize = 4;
    // udf, little-endian
    const TRAP_PATTERN: &'static [u8] = &[0xF0, 0x00, 0xF0, 0xE7];

    fn preamble(code: Option<&mut Vec<u8>>) -> usize {
        preamble(code)
    }

    fn encode(op: &Op, code: Option<(&mut Vec<u8>, &LabelMap)>) -> VmResult<usize> {
        encode(op, code)
    }
}

fn host_reg(reg: Register) -> VmResult<u32> {
    const REGS: [u8; NUM_REGISTERS] = [
        0x0, // r0
        0x1, // r1
        0x2, // r2
        0x3, // r3
    ];
    REGS.get(reg as usize)
        .copied()
        .map(u32::from)
        .ok_or(VmError::InvalidRegister(reg))
}

fn put(code: Option<&mut Vec<u8>>, words: &[u32]) -> usize {
    if let Some(code) = code {
        for word in words {
            code.extend_from_slice(&word.to_le_bytes());
        }
    }
    words.len() * 4
}

fn buf<'a>(sink: Option<(&'a mut Vec<u8>, &LabelMap)>) -> Option<&'a mut Vec<u8>> {
    sink.map(|(code, _)| code)
}

/// `b`/`beq` reaching `target` from the branch word at byte position
/// `at`: the displacement is in words, relative to the branch address
/// plus 8 (the A32 pipeline offset).
fn branch_word(opcode: u32, at: usize, target: usize) -> u32 {
    let rel_words = (target as i64 - (at as i64 + 8)) / 4;
    opcode | (rel_words as u32 & 0x00FF_FFFF)
}

fn resolve(labels: &LabelMap, target: &Label) -> VmResult<usize> {
    labels
        .get(target)
        .copied()
        .ok_or(VmError::UnknownLabel(*target))
}

fn preamble(code: Option<&mut Vec<u8>>) -> usize {
    const ENTER: [u32; 10] = [
        // push {r14}
        0xE52D_E004,
        // push {r0} (the NativeState address)
        0xE52D_0004,
        // ldr r1, [r0, #4]
        0xE590_1004,
        // ldr r2, [r0, #8]
        0xE590_2008,
        // ldr r3, [r0, #12]
        0xE590_300C,
        // ldr r12, [r0, #16]
        0xE590_C010,
        // ldr r0, [r0, #0]
        0xE590_0000,
        // add r14, pc, #4 (return address, x86 call style)
        0xE28F_E004,
        // push {r14}
        0xE52D_E004,
        // b over the epilogue into the body (patched)
        0xE1A0_0000,
    ];
    const LEAVE: [u32; 9] = [
        // pop {r12} (the NativeState address)
        0xE49D_C004,
        // str r0, [r12, #0]
        0xE58C_0000,
        // str r1, [r12, #4]
        0xE58C_1004,
        // str r2, [r12, #8]
        0xE58C_2008,
        // str r3, [r12, #12]
        0xE58C_300C,
        // pop {pc}
        0xE49D_F004,
        // udf fall-through guard
        0xE7F0_00F0,
        0xE7F0_00F0,
        0xE7F0_00F0,
    ];
    if let Some(code) = code {
        let mut enter = ENTER;
        let branch_at = (ENTER.len() - 1) * 4;
        let body = (ENTER.len() + LEAVE.len()) * 4;
        enter[ENTER.len() - 1] = branch_word(0xEA00_0000, branch_at, body);
        put(Some(code), &enter);
        put(Some(code), &LEAVE);
    }
    (ENTER.len() + LEAVE.len()) * 4
}

fn encode(op: &Op, sink: Option<(&mut Vec<u8>, &LabelMap)>) -> VmResult<usize> {
    match *op {
        // Nothing to lower; a label only mattered to the sizing pass.
        Op::Nop | Op::Label { .. } => Ok(0),
        Op::Return => {
            // pop {pc}
            Ok(put(buf(sink), &[0xE49D_F004]))
        }
        Op::Load { dst, addr } => {
            let dst = host_reg(dst)?;
            let addr = host_reg(addr)?;
            Ok(put(
                buf(sink),
                &[
                    // add r14, r12, addr
                    0xE08C_E000 | addr,
                    // ldrb dst, [r14]
                    0xE5DE_0000 | (dst << 12),
                ],
            ))
        }
        Op::Store { addr, src } => {
            let addr = host_reg(addr)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // add r14, r12, addr
                    0xE08C_E000 | addr,
                    // strb src, [r14]
                    0xE5CE_0000 | (src << 12),
                ],
            ))
        }
        Op::SetReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            // mov dst, src
            Ok(put(buf(sink), &[0xE1A0_0000 | (dst << 12) | src]))
        }
        Op::SetImm { dst, imm } => {
            let dst = host_reg(dst)?;
            // mov dst, #imm
            Ok(put(buf(sink), &[0xE3A0_0000 | (dst << 12) | imm as u32]))
        }
        Op::AddReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // add dst, dst, src
                    0xE080_0000 | (dst << 16) | (dst << 12) | src,
                    // and dst, dst, #255
                    0xE200_0000 | (dst << 16) | (dst << 12) | 0xFF,
                ],
            ))
        }
        Op::AddImm { dst, imm } => {
            let dst = host_reg(dst)?;
            Ok(put(
                buf(sink),
                &[
                    // mov r14, #imm
                    0xE3A0_E000 | imm as u32,
                    // add dst, dst, r14
                    0xE080_0000 | (dst << 16) | (dst << 12) | 0xE,
                    // and dst, dst, #255
                    0xE200_0000 | (dst << 16) | (dst << 12) | 0xFF,
                ],
            ))
        }
        Op::Negate { reg } => {
            let reg = host_reg(reg)?;
            Ok(put(
                buf(sink),
                &[
                    // rsb reg, reg, #0
                    0xE260_0000 | (reg << 16) | (reg << 12),
                    // and reg, reg, #255
                    0xE200_0000 | (reg << 16) | (reg << 12) | 0xFF,
                ],
            ))
        }
        Op::Jump { target } => {
            if let Some((code, labels)) = sink {
                let target = resolve(labels, &target)?;
                // b <label>
                let at = code.len();
                return Ok(put(Some(code), &[branch_word(0xEA00_0000, at, target)]));
            }
            Ok(4)
        }
        Op::JumpIfZero { reg, target } => {
            let reg = host_reg(reg)?;
            if let Some((code, labels)) = sink {
                let target = resolve(labels, &target)?;
                let at = code.len();
                return Ok(put(
                    Some(code),
                    &[
                        // cmp reg, #0
                        0xE350_0000 | (reg << 16),
                        // beq <label>
                        branch_word(0x0A00_0000, at + 4, target),
                    ],
                ));
            }
            Ok(8)
        }
        Op::Call { target } => {
            if let Some((code, labels)) = sink {
                let target = resolve(labels, &target)?;
                let at = code.len();
                return Ok(put(
                    Some(code),
                    &[
                        // add r14, pc, #4 (address of the op after the branch)
                        0xE28F_E004,
                        // push {r14}
                        0xE52D_E004,
                        // b <label>
                        branch_word(0xEA00_0000, at + 8, target),
                    ],
                ));
            }
            Ok(12)
        }
        Op::CallOut { func } => Ok(encode_callout(func, buf(sink))),
    }
}

fn encode_callout(func: CallOutFunc, code: Option<&mut Vec<u8>>) -> usize {
    // Spills the virtual registers and the data pointer into a
    // NativeState-shaped region on an 8-byte aligned stack, then calls
    // the helper thunk with r0 = state, r1 = func. The two constant
    // pointers sit in line as literals, each behind a branch that
    // skips it and loaded with ldr from the pipeline pc.
    const ENTER: [u32; 12] = [
        // mov r14, sp
        0xE1A0_E00D,
        // bic sp, sp, #7
        0xE3CD_D007,
        // sub sp, sp, #0x20
        0xE24D_D020,
        // str r0, [sp, #0]
        0xE58D_0000,
        // str r1, [sp, #4]
        0xE58D_1004,
        // str r2, [sp, #8]
        0xE58D_2008,
        // str r3, [sp, #12]
        0xE58D_300C,
        // str r12, [sp, #16]
        0xE58D_C010,
        // str r14, [sp, #0x1c] (the unaligned sp, restored on exit)
        0xE58D_E01C,
        // mov r0, sp
        0xE1A0_000D,
        // ldr r1, [pc, #0] (func literal)
        0xE59F_1000,
        // b over the literal
        0xEA00_0000,
    ];
    const LOAD_THUNK: [u32; 2] = [
        // ldr r14, [pc, #0] (thunk literal)
        0xE59F_E000,
        // b over the literal
        0xEA00_0000,
    ];
    const CALL: [u32; 1] = [
        // blx r14
        0xE12F_FF3E,
    ];
    const LEAVE: [u32; 7] = [
        // ldr r0, [sp, #0]
        0xE59D_0000,
        // ldr r1, [sp, #4]
        0xE59D_1004,
        // ldr r2, [sp, #8]
        0xE59D_2008,
        // ldr r3, [sp, #12]
        0xE59D_300C,
        // ldr r12, [sp, #16]
        0xE59D_C010,
        // ldr r14, [sp, #0x1c]
        0xE59D_E01C,
        // mov sp, r14
        0xE1A0_D00E,
    ];
    if let Some(code) = code {
        put(Some(code), &ENTER);
        put(Some(code), &[func as usize as u32]);
        put(Some(code), &LOAD_THUNK);
        let thunk: CallOutThunk = callout_thunk;
        put(Some(code), &[thunk as usize as u32]);
        put(Some(code), &CALL);
        put(Some(code), &LEAVE);
    }
    (ENTER.len() + 1 + LOAD_THUNK.len() + 1 + CALL.len() + LEAVE.len()) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ExecutionEnvironment;

    fn noop_callback(_env: &mut ExecutionEnvironment) {}

    fn emit(op: &Op, labels: &LabelMap) -> Vec<u8> {
        let mut code = Vec::new();
        encode(op, Some((&mut code, labels))).expect("emission should succeed");
        code
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    fn all_ops() -> Vec<Op> {
        vec![
            Op::nop(),
            Op::ret(),
            Op::load(0, 1),
            Op::store(2, 3),
            Op::set_reg(1, 0),
            Op::set_imm(3, 255),
            Op::add_reg(0, 2),
            Op::add_imm(1, 9),
            Op::negate(2),
            Op::jump("l"),
            Op::jump_if_zero(0, "l"),
            Op::call("l"),
            Op::label("l"),
            Op::call_out(noop_callback),
        ]
    }

    #[test]
    fn sizing_matches_emission_for_every_op() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 64);
        for op in all_ops() {
            let sized = encode(&op, None).expect("sizing should succeed");
            assert_eq!(sized, emit(&op, &labels).len(), "op {op:?}");
        }
    }

    #[test]
    fn every_op_emits_whole_words() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 64);
        for op in all_ops() {
            assert_eq!(emit(&op, &labels).len() % 4, 0, "op {op:?}");
        }
    }

    #[test]
    fn preamble_sizing_matches_emission() {
        let mut code = Vec::new();
        let sized = preamble(None);
        let written = preamble(Some(&mut code));
        assert_eq!(sized, written);
        assert_eq!(code.len(), sized);
    }

    #[test]
    fn preamble_branch_lands_after_the_epilogue() {
        let mut code = Vec::new();
        preamble(Some(&mut code));
        let words = words(&code);
        // b at word 9 reaching word 19, just past the 9-word epilogue
        assert_eq!(words[9], 0xEA00_0000 | 8);
    }

    #[test]
    fn return_pops_the_program_counter() {
        let code = emit(&Op::ret(), &LabelMap::new());
        assert_eq!(words(&code), vec![0xE49D_F004]);
    }

    #[test]
    fn set_imm_selects_the_register() {
        let code = emit(&Op::set_imm(2, 0x2A), &LabelMap::new());
        assert_eq!(words(&code), vec![0xE3A0_202A]);
    }

    #[test]
    fn load_and_store_move_single_bytes() {
        let load = words(&emit(&Op::load(1, 2), &LabelMap::new()));
        assert_eq!(load, vec![0xE08C_E002, 0xE5DE_1000]);
        let store = words(&emit(&Op::store(2, 1), &LabelMap::new()));
        assert_eq!(store, vec![0xE08C_E002, 0xE5CE_1000]);
    }

    #[test]
    fn arithmetic_ends_with_a_byte_mask() {
        for op in [Op::add_imm(0, 200), Op::add_reg(3, 1), Op::negate(2)] {
            let last = *words(&emit(&op, &LabelMap::new())).last().unwrap();
            assert_eq!(last & 0x0FF0_00FF, 0x0200_00FF, "op {op:?}");
        }
    }

    #[test]
    fn forward_jump_displacement_accounts_for_the_pipeline() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 100);
        let mut code = vec![0u8; 20];
        encode(&Op::jump("l"), Some((&mut code, &labels))).expect("emission should succeed");
        // (100 - (20 + 8)) / 4
        let branch = u32::from_le_bytes(code[20..24].try_into().unwrap());
        assert_eq!(branch, 0xEA00_0000 | 18);
    }

    #[test]
    fn backward_jump_displacement_is_negative() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 0);
        let mut code = vec![0u8; 16];
        encode(&Op::jump("l"), Some((&mut code, &labels))).expect("emission should succeed");
        // (0 - (16 + 8)) / 4 = -6, masked to 24 bits
        let branch = u32::from_le_bytes(code[16..20].try_into().unwrap());
        assert_eq!(branch, 0xEA00_0000 | (0x00FF_FFFF & (-6i32 as u32)));
    }

    #[test]
    fn call_pushes_a_fake_link_register() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 64);
        let code = words(&emit(&Op::call("l"), &labels));
        assert_eq!(code[0], 0xE28F_E004);
        assert_eq!(code[1], 0xE52D_E004);
        assert_eq!(code[2], 0xEA00_0000 | 12);
    }

    #[test]
    fn unknown_label_fails_emission_but_not_sizing() {
        let op = Op::jump_if_zero(1, "missing");
        assert_eq!(encode(&op, None), Ok(8));
        let mut code = Vec::new();
        assert_eq!(
            encode(&op, Some((&mut code, &LabelMap::new()))),
            Err(VmError::UnknownLabel(Label::new("missing")))
        );
    }

    #[test]
    fn out_of_range_register_is_rejected() {
        assert_eq!(
            encode(&Op::negate(4), None),
            Err(VmError::InvalidRegister(4))
        );
    }

    #[test]
    fn callout_embeds_literals_behind_branches() {
        let code = words(&emit(&Op::call_out(noop_callback), &LabelMap::new()));
        // ldr r1, [pc] / b / <func>
        assert_eq!(code[10], 0xE59F_1000);
        assert_eq!(code[11], 0xEA00_0000);
        assert_eq!(code[12], noop_callback as usize as u32);
        // ldr r14, [pc] / b / <thunk> / blx r14
        assert_eq!(code[13], 0xE59F_E000);
        assert_eq!(code[14], 0xEA00_0000);
        let expected: CallOutThunk = callout_thunk;
        assert_eq!(code[15], expected as usize as u32);
        assert_eq!(code[16], 0xE12F_FF3E);
    }
}
