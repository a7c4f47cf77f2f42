use m68k_jit::{
    Ccr, FallbackOutcome, FlatMemory, GuestMemory, GuestState, InterpreterFallback, JitConfig,
    SpecialFlags, X86_64JitEngine,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Jit(#[from] m68k_jit::Error),
}

/// A minimal interpreter covering exactly the handful of opcodes this demo program uses. A real
/// embedder's interpreter is the full 68k instruction set; the JIT only ever needs to be correct
/// for the opcodes it chooses to compile, falling back here for everything else.
struct DemoInterpreter;

impl InterpreterFallback<FlatMemory> for DemoInterpreter {
    fn execute(&mut self, state: &mut GuestState, memory: &mut FlatMemory, opcode: u16) -> FallbackOutcome {
        // MOVEQ #data,Dn: 0111 ddd0 dddddddd
        if opcode & 0xf100 == 0x7000 {
            let dn = ((opcode >> 9) & 0x7) as usize;
            let data = (opcode & 0xff) as i8 as i32 as u32;
            state.regs[dn] = data;
            state.pc = state.pc.wrapping_add(2);
            return FallbackOutcome::Continue;
        }
        // ADD.L Dm,Dn (register-direct, opmode 010): 1101 nnn 010 000 mmm
        if opcode & 0xf1f8 == 0xd080 {
            let dn = ((opcode >> 9) & 0x7) as usize;
            let dm = (opcode & 0x7) as usize;
            state.regs[dn] = state.regs[dn].wrapping_add(state.regs[dm]);
            state.pc = state.pc.wrapping_add(2);
            return FallbackOutcome::Continue;
        }
        // CMP.L Dm,Dn: 1011 nnn 010 000 mmm
        if opcode & 0xf1f8 == 0xb080 {
            let dn = ((opcode >> 9) & 0x7) as usize;
            let dm = (opcode & 0x7) as usize;
            let (result, borrow) = state.regs[dn].overflowing_sub(state.regs[dm]);
            let mut ccr = Ccr::empty();
            ccr.set(Ccr::C, borrow);
            ccr.set(Ccr::Z, result == 0);
            ccr.set(Ccr::N, (result as i32) < 0);
            state.set_ccr(ccr);
            state.pc = state.pc.wrapping_add(2);
            return FallbackOutcome::Continue;
        }
        // Bcc/BRA: 0110 cccc dddddddd, restricted here to BNE (cond 0110) and BRA (cond 0000).
        if opcode & 0xf000 == 0x6000 {
            let cond = (opcode >> 8) & 0xf;
            let disp8 = (opcode & 0xff) as u8;
            let disp = disp8 as i8 as i32;
            let base = state.pc.wrapping_add(2);
            let taken = (base as i64 + disp as i64) as u32;
            let take = match cond {
                0b0000 => true,
                0b0110 => !state.ccr().contains(Ccr::Z),
                _ => false,
            };
            state.pc = if take { taken } else { base };
            return FallbackOutcome::ExitBlock;
        }

        // Falling off the loop lands here (0x1008 is never written to): the natural exit once
        // D0 catches up with D2 and BNE falls through instead of looping.
        state.spcflags.insert(SpecialFlags::BREAK);
        FallbackOutcome::ExitBlock
    }
}

fn main() -> Result<(), Error> {
    let mut engine = X86_64JitEngine::new(JitConfig::default())?;

    let mut memory = FlatMemory::new(0x10000);
    // D0 = 0 (MOVEQ #0,D0)
    memory.write_u16(0x1000, 0x7000);
    // loop: D0 += D1 (ADD.L D1,D0)
    memory.write_u16(0x1002, 0xd081);
    // CMP.L D2,D0
    memory.write_u16(0x1004, 0xb082);
    // BNE loop (back to 0x1002: disp = 0x1002 - (0x1006 + 2) = -6)
    memory.write_u16(0x1006, 0x66fa);

    let mut state = GuestState::new();
    state.pc = 0x1000;
    state.regs[1] = 1; // D1: increment
    state.regs[2] = 200_000; // D2: loop bound

    // 200,000 passes through the loop body easily cross `m68k_jit::trace::COMPILE_THRESHOLD`, so
    // the bulk of the run executes from compiled code rather than the interpreter.
    let mut interpreter = DemoInterpreter;

    engine.enter(&mut state, &mut memory, &mut interpreter);

    println!("D0 = {} after {} loop iterations", state.regs[0], state.regs[2]);
    Ok(())
}
