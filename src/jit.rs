use std::collections::HashMap;

use log::debug;

use crate::vm::{
    CallOutFunc, ExecutionEnvironment, Label, NUM_REGISTERS, Op, Program, Value, VmResult,
};

mod mem;

// The x86-64 backend follows the SysV calling convention and the ARM
// backend assumes a unix icache/mmap story, so both are unix-only.
// The x86-32 backend is plain cdecl and works on Windows too.
#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64;

#[cfg(target_arch = "x86")]
mod x86;

#[cfg(all(target_arch = "arm", unix))]
mod a32;

#[cfg(all(target_arch = "x86_64", unix))]
type ActiveBackend = x86_64::X86_64Backend;

#[cfg(target_arch = "x86")]
type ActiveBackend = x86::X86Backend;

#[cfg(all(target_arch = "arm", unix))]
type ActiveBackend = a32::A32Backend;

/// Label name to byte offset within the code buffer. Built by the
/// sizing pass, consumed while emitting; scoped to one `compile`.
pub(crate) type LabelMap = HashMap<Label, usize>;

/// The struct through which the host and the generated code exchange
/// register values. Registers live in native-word slots here; the
/// driver truncates back to [`Value`] width when copying out.
#[repr(C)]
pub(crate) struct NativeState {
    regs: [usize; NUM_REGISTERS],
    data: *mut u8,
}

type NativeEntry = unsafe extern "C" fn(*mut NativeState);

/// Signature of the helper the `CallOut` snippet calls. The second
/// argument is a [`CallOutFunc`] smuggled through the C ABI as a
/// plain pointer.
pub(crate) type CallOutThunk = unsafe extern "C" fn(*mut NativeState, *const ());

/// Bridges generated code to a host callback: copies the spilled
/// native register slots into the environment, invokes the callback,
/// and copies the possibly-updated registers back.
///
/// Must stay a plain function so its address can be embedded in the
/// instruction stream.
pub(crate) unsafe extern "C" fn callout_thunk(state: *mut NativeState, func: *const ()) {
    let state = unsafe { &mut *state };
    // `data` points at the environment's memory base, which is also
    // the environment itself.
    let env = unsafe { &mut *(state.data as *mut ExecutionEnvironment) };
    for (slot, reg) in state.regs.iter().zip(env.regs.iter_mut()) {
        *reg = *slot as Value;
    }
    let func: CallOutFunc = unsafe { std::mem::transmute(func) };
    func(env);
    for (slot, reg) in state.regs.iter_mut().zip(env.regs.iter()) {
        *slot = *reg as usize;
    }
}

/// One native code generator. `preamble` and `encode` report their
/// byte count when handed no buffer and write exactly that many bytes
/// otherwise; the two counts agreeing for every op is what makes the
/// size-then-emit scheme sound.
pub(crate) trait NativeBackend {
    /// Bytes per register slot in [`NativeState`].
    const WORD_SIZE: usize;

    /// Instruction pattern used to fill unused tail space so stray
    /// control flow traps instead of running stale bytes.
    const TRAP_PATTERN: &'static [u8];

    /// The entry/exit shim bridging the platform calling convention
    /// to the generated body.
    fn preamble(code: Option<&mut Vec<u8>>) -> usize;

    /// One op, appended at the current end of `code`.
    fn encode(op: &Op, code: Option<(&mut Vec<u8>, &LabelMap)>) -> VmResult<usize>;
}

/// Compiles `program` for the host architecture.
///
/// Unlike the interpreter, compiled code ignores `env.pc` and always
/// enters at the first op.
#[cfg(any(
    all(target_arch = "x86_64", unix),
    target_arch = "x86",
    all(target_arch = "arm", unix),
))]
pub fn compile(program: &Program) -> VmResult<CompiledCode> {
    compile_with::<ActiveBackend>(program)
}

#[cfg(not(any(
    all(target_arch = "x86_64", unix),
    target_arch = "x86",
    all(target_arch = "arm", unix),
)))]
pub fn compile(_program: &Program) -> VmResult<CompiledCode> {
    Err(crate::vm::VmError::UnsupportedTarget(
        std::env::consts::ARCH,
    ))
}

#[cfg(any(
    all(target_arch = "x86_64", unix),
    target_arch = "x86",
    all(target_arch = "arm", unix),
))]
fn compile_with<B: NativeBackend>(program: &Program) -> VmResult<CompiledCode> {
    use crate::vm::VmError;

    debug_assert_eq!(B::WORD_SIZE, std::mem::size_of::<usize>());

    // Sizing pass: label byte offsets plus the total length. A label
    // is recorded at the running offset before its own (zero) bytes.
    let mut labels = LabelMap::new();
    let mut total = B::preamble(None);
    for op in program.ops() {
        if let Op::Label { name } = op {
            if labels.insert(*name, total).is_some() {
                return Err(VmError::DuplicateLabel(*name));
            }
        }
        total += B::encode(op, None)?;
    }
    debug!(
        "sized program to {} bytes ({} labels)",
        total,
        labels.len()
    );

    // Emission pass. Jump displacements resolve against the now
    // complete label map.
    let mut code = Vec::with_capacity(total);
    B::preamble(Some(&mut code));
    for op in program.ops() {
        B::encode(op, Some((&mut code, &labels)))?;
    }
    assert_eq!(
        code.len(),
        total,
        "backend sized {} bytes but emitted {}",
        total,
        code.len()
    );

    let memory = mem::ExecutableMemory::from_code(&code, B::TRAP_PATTERN)?;
    debug!(
        "finalized {} code bytes in a {} byte mapping",
        code.len(),
        memory.len()
    );
    Ok(CompiledCode { memory })
}

/// An owning handle over a finalized executable buffer. Move-only;
/// the mapping is released when the handle drops.
pub struct CompiledCode {
    memory: mem::ExecutableMemory,
}

impl CompiledCode {
    /// Executes the compiled program against `env`.
    pub fn run(&self, env: &mut ExecutionEnvironment) {
        let mut state = NativeState {
            regs: [0; NUM_REGISTERS],
            data: env.mem.as_mut_ptr(),
        };
        for (slot, reg) in state.regs.iter_mut().zip(env.regs.iter()) {
            *slot = *reg as usize;
        }

        let entry: NativeEntry = unsafe { std::mem::transmute(self.memory.entry()) };
        unsafe { entry(&mut state) };

        for (slot, reg) in state.regs.iter().zip(env.regs.iter_mut()) {
            *reg = *slot as Value;
        }
    }
}
