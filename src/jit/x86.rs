//! x86-32 code generation.
//!
//! Only eax, ecx, and edx are caller-saved, so the preamble saves the
//! rest before trampling them:
//!
//! - r0..r3 -> eax, ecx, edx, ebx
//! - edi    -> base data pointer / environment
//! - esi    -> temporary

use super::{CallOutThunk, LabelMap, NativeBackend, callout_thunk};
use crate::vm::{CallOutFunc, Label, NUM_REGISTERS, Op, Register, VmError, VmResult};

pub(crate) struct X86Backend;

impl NativeBackend for X86Backend {
    const WORD_SIZE: usize = 4;
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
        0x0, // eax
        0x1, // ecx
        0x2, // edx
        0x3, // ebx
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
    const ENTER: [u8; 29] = [
        // push %ebx
        0x53,
        // push %edi
        0x57,
        // push %esi
        0x56,
        // sub $0x20,%esp
        0x83, 0xEC, 0x20,
        // mov 0x30(%esp),%esi (cdecl argument: 0x20 + three pushes + return address)
        0x8B, 0x74, 0x24, 0x30,
        // mov (%esi),%eax
        0x8B, 0x06,
        // mov 0x4(%esi),%ecx
        0x8B, 0x4E, 0x04,
        // mov 0x8(%esi),%edx
        0x8B, 0x56, 0x08,
        // mov 0xc(%esi),%ebx
        0x8B, 0x5E, 0x0C,
        // mov 0x10(%esi),%edi
        0x8B, 0x7E, 0x10,
        // call over the epilogue into the body
        0xE8, 0x00, 0x00, 0x00, 0x00,
    ];
    const LEAVE: [u8; 28] = [
        // mov 0x30(%esp),%esi
        0x8B, 0x74, 0x24, 0x30,
        // mov %eax,(%esi)
        0x89, 0x06,
        // mov %ecx,0x4(%esi)
        0x89, 0x4E, 0x04,
        // mov %edx,0x8(%esi)
        0x89, 0x56, 0x08,
        // mov %ebx,0xc(%esi)
        0x89, 0x5E, 0x0C,
        // mov %edi,0x10(%esi)
        0x89, 0x7E, 0x10,
        // add $0x20,%esp
        0x83, 0xC4, 0x20,
        // pop %esi
        0x5E,
        // pop %edi
        0x5F,
        // pop %ebx
        0x5B,
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
                    // mov %edi,%esi
                    0x89, 0xFE,
                    // add addr,%esi
                    0x01, 0xC6 | (addr << 3),
                    // movzbl (%esi),dst
                    0x0F, 0xB6, 0x06 | (dst << 3),
                ],
            ))
        }
        Op::Store { addr, src } => {
            let addr = host_reg(addr)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // mov %edi,%esi
                    0x89, 0xFE,
                    // add addr,%esi
                    0x01, 0xC6 | (addr << 3),
                    // mov srcb,(%esi)
                    0x88, 0x06 | (src << 3),
                ],
            ))
        }
        Op::SetReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            // mov src,dst
            Ok(put(buf(sink), &[0x89, 0xC0 | (src << 3) | dst]))
        }
        Op::SetImm { dst, imm } => {
            let dst = host_reg(dst)?;
            // mov $imm,dst
            Ok(put(buf(sink), &[0xB8 | dst, imm, 0x00, 0x00, 0x00]))
        }
        Op::AddReg { dst, src } => {
            let dst = host_reg(dst)?;
            let src = host_reg(src)?;
            Ok(put(
                buf(sink),
                &[
                    // add src,dst
                    0x01, 0xC0 | (src << 3) | dst,
                    // and $0xff,dst
                    0x81, 0xE0 | dst, 0xFF, 0x00, 0x00, 0x00,
                ],
            ))
        }
        Op::AddImm { dst, imm } => {
            let dst = host_reg(dst)?;
            Ok(put(
                buf(sink),
                &[
                    // add $imm,dst
                    0x81, 0xC0 | dst, imm, 0x00, 0x00, 0x00,
                    // and $0xff,dst
                    0x81, 0xE0 | dst, 0xFF, 0x00, 0x00, 0x00,
                ],
            ))
        }
        Op::Negate { reg } => {
            let reg = host_reg(reg)?;
            Ok(put(
                buf(sink),
                &[
                    // neg reg
                    0xF7, 0xD8 | reg,
                    // and $0xff,reg
                    0x81, 0xE0 | reg, 0xFF, 0x00, 0x00, 0x00,
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
                    0x85, 0xC0 | (reg << 3) | reg,
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
    // NativeState-shaped region on the stack, then pushes (func,
    // state) as cdecl arguments for the helper thunk.
    const ENTER: [u8; 32] = [
        // sub $0x38,%esp
        0x83, 0xEC, 0x38,
        // mov %eax,0x18(%esp)
        0x89, 0x44, 0x24, 0x18,
        // mov %ecx,0x1c(%esp)
        0x89, 0x4C, 0x24, 0x1C,
        // mov %edx,0x20(%esp)
        0x89, 0x54, 0x24, 0x20,
        // mov %ebx,0x24(%esp)
        0x89, 0x5C, 0x24, 0x24,
        // mov %edi,0x28(%esp)
        0x89, 0x7C, 0x24, 0x28,
        // lea 0x18(%esp),%ecx
        0x8D, 0x4C, 0x24, 0x18,
        // mov $func,%eax
        0xB8, 0x00, 0x00, 0x00, 0x00,
    ];
    const CALL_THUNK: [u8; 7] = [
        // push %eax (func)
        0x50,
        // push %ecx (state)
        0x51,
        // mov $thunk,%eax
        0xB8, 0x00, 0x00, 0x00, 0x00,
    ];
    const LEAVE: [u8; 27] = [
        // call *%eax
        0xFF, 0xD0,
        // pop the two arguments
        0x58, 0x58,
        // mov 0x18(%esp),%eax
        0x8B, 0x44, 0x24, 0x18,
        // mov 0x1c(%esp),%ecx
        0x8B, 0x4C, 0x24, 0x1C,
        // mov 0x20(%esp),%edx
        0x8B, 0x54, 0x24, 0x20,
        // mov 0x24(%esp),%ebx
        0x8B, 0x5C, 0x24, 0x24,
        // mov 0x28(%esp),%edi
        0x8B, 0x7C, 0x24, 0x28,
        // add $0x38,%esp
        0x83, 0xC4, 0x38,
    ];
    if let Some(code) = code {
        let mut enter = ENTER;
        let at = enter.len() - 4;
        enter[at..].copy_from_slice(&(func as usize).to_le_bytes());
        code.extend_from_slice(&enter);

        let mut call_thunk = CALL_THUNK;
        let thunk: CallOutThunk = callout_thunk;
        call_thunk[3..].copy_from_slice(&(thunk as usize).to_le_bytes());
        code.extend_from_slice(&call_thunk);

        code.extend_from_slice(&LEAVE);
    }
    ENTER.len() + CALL_THUNK.len() + LEAVE.len()
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
    fn preamble_sizing_matches_emission() {
        let mut code = Vec::new();
        let sized = preamble(None);
        let written = preamble(Some(&mut code));
        assert_eq!(sized, written);
        assert_eq!(code.len(), sized);
    }

    #[test]
    fn set_imm_selects_the_register() {
        let code = emit(&Op::set_imm(2, 0x2A), &LabelMap::new());
        assert_eq!(code, vec![0xBA, 0x2A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn load_zero_extends_a_single_byte() {
        let code = emit(&Op::load(0, 1), &LabelMap::new());
        // movzbl (%esi),%eax
        assert_eq!(&code[code.len() - 3..], &[0x0F, 0xB6, 0x06]);
    }

    #[test]
    fn store_writes_a_single_byte() {
        let code = emit(&Op::store(0, 3), &LabelMap::new());
        // mov %bl,(%esi)
        assert_eq!(&code[code.len() - 2..], &[0x88, 0x1E]);
    }

    #[test]
    fn jump_displacement_is_relative_to_instruction_end() {
        let mut labels = LabelMap::new();
        labels.insert(Label::new("l"), 100);
        let mut code = vec![0u8; 16];
        encode(&Op::jump("l"), Some((&mut code, &labels))).expect("emission should succeed");
        assert_eq!(code[16], 0xE9);
        assert_eq!(i32::from_le_bytes(code[17..21].try_into().unwrap()), 79);
    }

    #[test]
    fn unknown_label_fails_emission_but_not_sizing() {
        let op = Op::call("missing");
        assert_eq!(encode(&op, None), Ok(5));
        let mut code = Vec::new();
        assert_eq!(
            encode(&op, Some((&mut code, &LabelMap::new()))),
            Err(VmError::UnknownLabel(Label::new("missing")))
        );
    }

    #[test]
    fn out_of_range_register_is_rejected() {
        assert_eq!(
            encode(&Op::add_reg(0, 4), None),
            Err(VmError::InvalidRegister(4))
        );
    }

    #[test]
    fn callout_embeds_both_pointers() {
        let code = emit(&Op::call_out(noop_callback), &LabelMap::new());
        let func = u32::from_le_bytes(code[28..32].try_into().unwrap());
        assert_eq!(func as usize, noop_callback as usize);
        let thunk = u32::from_le_bytes(code[35..39].try_into().unwrap());
        let expected: CallOutThunk = callout_thunk;
        assert_eq!(thunk as usize, expected as usize);
    }
}
