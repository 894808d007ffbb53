//! x86-64 code generation.
//!
//! Only caller-saved registers are used, so the preamble has nothing
//! to preserve for the caller:
//!
//! - r0..r3 -> rax, rcx, rdx, rsi
//! - r10    -> base data pointer / environment
//! - r11    -> temporary

use super::{CallOutThunk, LabelMap, NativeBackend, callout_thunk};
use crate::vm::{CallOutFunc, Label, NUM_REGISTERS, Op, Register, VmError, VmResult};

pub(crate) struct X86_64Backend;

impl NativeBackend for X86_64Backend {
    const WORD_SIZE: usize = 8;
    const TRAP_PATTERN: &'static [u8] = &[0xCC]; // int3

    fn preamble(code: Option<&mut Vec<u8>>) -> usize {
        preamble(code)
    }

    fn encode(op: &Op, code: Option<(&mut Vec<u8>, &LabelMap)>) -> VmResult<usize> {
        encode(op, code)
    }
}

fn host_reg(reg: Register) -> VmResult<u8> {
    const REGS: [u8; NUM_REGISTERS] = [
        0x0, // rax
        0x1, // rcx
        0x2, // rdx
        0x6, // rsi
    ];
    REGS.get(reg as usize)
        .copied()
        .ok_or(VmError::InvalidRegister(reg))
}

fn put(code: Option<&mut Vec<u8>>, ins: &[u8]) -> usize {
    if let Some(code) = code {
        code.extend_from_slice(ins);
    }
    ins.len()
}

fn buf<'a>(sink: Option<(&'a mut Vec<u8>, &LabelMap)>) -> Option<&'a mut Vec<u8>> {
    sink.map(|(code, _)| code)
}

/// Appends a branch whose trailing rel32 is patched to reach `target`,
/// measured from the end of the instruction.
fn put_branch(
    sink: Option<(&mut Vec<u8>, &LabelMap)>,
    target: &Label,
    ins: &mut [u8],
) -> VmResult<usize> {
    if let Some((code, labels)) = sink {
        let offset = labels
            .get(target)
            .copied()
            .ok_or(VmError::UnknownLabel(*target))?;
        let rel = offset as i64 - (code.len() + ins.len()) as i64;
        let at = ins.len() - 4;
        ins[at..].copy_from_slice(&(rel as i32).to_le_bytes());
        code.extend_from_slice(ins);
    }
    Ok(ins.len())
}

fn preamble(code: Option<&mut Vec<u8>>) -> usize {
    const ENTER: [u8; 33] = [
        // sub $0x38,%rsp
        0x48, 0x83, 0xEC, 0x38,
        // mov %rdi,0x8(%rsp)
        0x48, 0x89, 0x7C, 0x24, 0x08,
        // mov (%rdi),%rax
        0x48, 0x8B, 0x07,
        // mov 0x8(%rdi),%rcx
        0x48, 0x8B, 0x4F, 0x08,
        // mov 0x10(%rdi),%rdx
        0x48, 0x8B, 0x57, 0x10,
        // mov 0x18(%rdi),%rsi
        0x48, 0x8B, 0x77, 0x18,
        // mov 0x20(%rdi),%r10
        0x4C, 0x8B, 0x57, 0x20,
        // call over the epilogue into the body
        0xE8, 0x00, 0x00, 0x00, 0x00,
    ];
    const LEAVE: [u8; 32] = [
        // mov 0x8(%rsp),%rdi
        0x48, 0x8B, 0x7C, 0x24, 0x08,
        // mov %rax,(%rdi)
        0x48, 0x89, 0x07,
        // mov %rcx,0x8(%rdi)
        0x48, 0x89, 0x4F, 0x08,
        // mov %rdx,0x10(%rdi)
        0x48, 0x89, 0x57, 0x10,
        // mov %rsi,0x18(%rdi)
        0x48, 0x89, 0x77, 0x18,
        // mov %r10,0x20(%rdi)
        0x4C, 0x89, 0x57, 0x20,
        // add $0x38,%rsp
        0x48, 0x83, 0xC4, 0x38,
        // ret
        0xC3,
        // int3 fall-through guard
        0xCC, 0xCC, 0xCC,
    ];
    if let Some(code) = code {
        let mut enter = ENTER;
        let at = enter.len() - 4;
        enter[at..].copy_from_slice(&(LEAVE.len() as u32).to_le_bytes());
        code.extend_from_slice(&enter);
        code.extend_from_slice(&LEAVE);
    }
    ENTER.len() + LEAVE.len()
}

fn encode(op: &Op, sink: Option<(&mut Vec<u8>, &LabelMap)>) -> VmResult<usize> {
    match *op {
        // Nothing to lower; a label only mattered to the sizing pass.
        Op::Nop | Op::Label { .. } => Ok(0),
        Op::Return => Ok(put(buf(sink), &[0xC3])), // ret
        Op::Load { dst, addr } => {
            let dst = host_reg(dst)?;
            let addr = host_reg(addr)?;
            Ok(put(
                buf(sink),
                &[
                    // mov %r10,%r11
                    0x4D, 0x89, 0xD3,
                    // add addr,%r11
                    0x49, 0x01, 0xC3 | (addr << 3),
                    // movzbl (%r11),dst
                    0x41, 0x0F, 0xB6, 0x03 | (dst << 3),
                ],
            ))
        }
        Op::Store { addr, src } => {
            let addr = host_reg(addr)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // mov %r10,%r11
                    0x4D, 0x89, 0xD3,
                    // add addr,%r11
                    0x49, 0x01, 0xC3 | (addr << 3),
                    // mov srcb,(%r11)
                    0x41, 0x88, 0x03 | (src << 3),
                ],
            ))
        }
        Op::SetReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            // mov src,dst
            Ok(put(buf(sink), &[0x48, 0x89, 0xC0 | (src << 3) | dst]))
        }
        Op::SetImm { dst, imm } => {
            let dst = host_reg(dst)?;
            // mov $imm,dst
            Ok(put(
                buf(sink),
                &[0x48, 0xC7, 0xC0 | dst, imm, 0x00, 0x00, 0x00],
            ))
        }
        Op::AddReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // add src,dst
                    0x48, 0x01, 0xC0 | (src << 3) | dst,
                    // and $0xff,dst
                    0x48, 0x81, 0xE0 | dst, 0xFF, 0x00, 0x00, 0x00,
                ],
            ))
        }
        Op::AddImm { dst, imm } => {
            let dst = host_reg(dst)?;
            Ok(put(
                buf(sink),
                &[
                    // add $imm,dst (sign-extended; the mask folds it mod 256)
                    0x48, 0x83, 0xC0 | dst, imm,
                    // and $0xff,dst
                    0x48, 0x81, 0xE0 | dst, 0xFF, 0x00, 0x00, 0x00,
                ],
            ))
        }
        Op::Negate { reg } => {
            let reg = host_reg(reg)?;
            Ok(put(
                buf(sink),
                &[
                    // neg reg
                    0x48, 0xF7, 0xD8 | reg,
                    // and $0xff,reg
                    0x48, 0x81, 0xE0 | reg, 0xFF, 0x00, 0x00, 0x00,
                ],
            ))
        }
        Op::Jump { target } => {
            // jmp <rel32>
            put_branch(sink, &target, &mut [0xE9, 0x00, 0x00, 0x00, 0x00])
        }
        Op::JumpIfZero { reg, target } => {
            let reg = host_reg(reg)?;
            put_branch(
                sink,
                &target,
                &mut [
                    // test reg,reg
                    0x48, 0x85, 0xC0 | (reg << 3) | reg,
                    // jz <rel32>
                    0x0F, 0x84, 0x00, 0x00, 0x00, 0x00,
                ],
            )
        }
        Op::Call { target } => {
            // call <rel32>; the pushed return address makes Return a
            // plain ret whether it exits a call or the whole program.
            put_branch(sink, &target, &mut [0xE8, 0x00, 0x00, 0x00, 0x00])
        }
        Op::CallOut { func } => Ok(encode_callout(func, buf(sink))),
    }
}

fn encode_callout(func: CallOutFunc, code: Option<&mut Vec<u8>>) -> usize {
    // Spills the virtual registers and the data pointer into a
    // NativeState-shaped region on the stack, then calls the helper
    // thunk with (state, func) per the SysV argument registers.
    const ENTER: [u8; 41] = [
        // sub $0x38,%rsp
        0x48, 0x83, 0xEC, 0x38,
        // mov %rax,(%rsp)
        0x48, 0x89, 0x04, 0x24,
        // mov %rcx,0x8(%rsp)
        0x48, 0x89, 0x4C, 0x24, 0x08,
        // mov %rdx,0x10(%rsp)
        0x48, 0x89, 0x54, 0x24, 0x10,
        // mov %rsi,0x18(%rsp)
        0x48, 0x89, 0x74, 0x24, 0x18,
        // mov %r10,0x20(%rsp)
        0x4C, 0x89, 0x54, 0x24, 0x20,
        // mov %rsp,%rdi
        0x48, 0x89, 0xE7,
        // movabs $func,%rsi
        0x48, 0xBE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    const CALL_THUNK: [u8; 10] = [
        // movabs $thunk,%rax
        0x48, 0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    const LEAVE: [u8; 30] = [
        // call *%rax
        0xFF, 0xD0,
        // mov (%rsp),%rax
        0x48, 0x8B, 0x04, 0x24,
        // mov 0x8(%rsp),%rcx
        0x48, 0x8B, 0x4C, 0x24, 0x08,
        // mov 0x10(%rsp),%rdx
        0x48, 0x8B, 0x54, 0x24, 0x10,
        // mov 0x18(%rsp),%rsi
        0x48, 0x8B, 0x74, 0x24, 0x18,
        // mov 0x20(%rsp),%r10
        0x4C, 0x8B, 0x54, 0x24, 0x20,
        // add $0x38,%rsp
        0x48, 0x83, 0xC4, 0x38,
    ];
    if let Some(code) = code {
        let mut enter = ENTER;
        let at = enter.len() - 8;
        enter[at..].copy_from_slice(&(func as usize).to_le_bytes());
        code.extend_from_slice(&enter);

        let mut call_thunk = CALL_THUNK;
        let thunk: CallOutThunk = callout_thunk;
        call_thunk[2..].copy_from_slice(&(thunk as usize).to_le_bytes());
        code.extend_from_slice(&call_thunk);

        code.extend_from_slice(&LEAVE);
    }
    ENTER.len() + CALL_THUNK.len() + LEAVE.len()
}
