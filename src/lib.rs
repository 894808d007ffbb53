pub mod jit;
pub mod vm;

pub use jit::{CompiledCode, compile};
pub use vm::{
    CallOutFunc, ExecutionEnvironment, Label, MEM_SIZE, NUM_REGISTERS, Op, Program, Register,
    Value, VmError, VmResult, run,
};
