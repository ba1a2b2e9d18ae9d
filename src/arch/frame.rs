//! # Armv7-M Exception Frames
//!
//! Layout of the initial context the Cortex-M4 port synthesizes on a fresh
//! task stack:
//!
//! ```text
//!  sp ──► R4 R5 R6 R7 R8 R9 R10 R11 │ R0 R1 R2 R3 R12 LR PC xPSR
//!         └─── saved by PendSV ───┘ └──── stacked by hardware ───┘
//! ```

/// Words in a synthesized initial context: R4–R11 then the hardware frame.
pub const FRAME_WORDS: usize = 16;

/// Word offsets into the context.
pub const LR_SLOT: usize = 13;
pub const PC_SLOT: usize = 14;
pub const XPSR_SLOT: usize = 15;

/// xPSR with only the Thumb bit set.
pub const INITIAL_XPSR: u32 = 0x0100_0000;

/// Bit 0 of an interworking branch target selects Thumb state.
const THUMB_BIT: u32 = 1;

/// PC as it must sit in an exception frame: the exception return loads it
/// verbatim, so bit 0 stays clear.
#[inline]
pub const fn stacked_pc(entry: usize) -> u32 {
    entry as u32 & !THUMB_BIT
}

/// Target for a `bx` to the code a stacked PC points at. `bx` to an even
/// address leaves Thumb state and faults on the M profile.
#[inline]
pub const fn branch_target(stacked: u32) -> u32 {
    stacked | THUMB_BIT
}

/// Write the initial context below `top`, aligned down to 8 bytes as AAPCS
/// requires at exception return. Returns the new stack pointer.
///
/// # Safety
/// The `FRAME_WORDS` words below `top` must be writable.
pub unsafe fn write_initial(top: *mut u32, entry: usize, exit: usize) -> *mut u32 {
    let top = ((top as usize) & !7) as *mut u32;
    let frame = top.sub(FRAME_WORDS);

    for word in 0..LR_SLOT {
        frame.add(word).write(0);
    }
    frame.add(LR_SLOT).write(exit as u32);
    frame.add(PC_SLOT).write(stacked_pc(entry));
    frame.add(XPSR_SLOT).write(INITIAL_XPSR);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_target_restores_thumb_bit() {
        let entry = 0x0800_1235usize;
        let pc = stacked_pc(entry);
        assert_eq!(pc & 1, 0);
        assert_eq!(branch_target(pc), 0x0800_1235);
        // already odd stays odd
        assert_eq!(branch_target(0x0800_1235), 0x0800_1235);
    }

    #[test]
    fn test_initial_frame_layout() {
        let mut stack = [0xffff_ffffu32; 40];
        // one word past an 8-byte boundary, to exercise the alignment
        let base = stack.as_mut_ptr();
        let top = unsafe { base.add(if base as usize % 8 == 0 { 33 } else { 32 }) };

        let sp = unsafe { write_initial(top, 0x0800_0401, 0x0800_0601) };
        assert_eq!(sp as usize % 8, 0);
        assert_eq!(unsafe { top.offset_from(sp) }, FRAME_WORDS as isize + 1);

        let frame = unsafe { core::slice::from_raw_parts(sp, FRAME_WORDS) };
        assert!(frame[..LR_SLOT].iter().all(|&w| w == 0));
        assert_eq!(frame[LR_SLOT], 0x0800_0601);
        assert_eq!(frame[PC_SLOT], 0x0800_0400);
        assert_eq!(frame[XPSR_SLOT], INITIAL_XPSR);
        assert_eq!(branch_target(frame[PC_SLOT]), 0x0800_0401);
    }
}
