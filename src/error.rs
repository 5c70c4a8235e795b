//! Error kinds surfaced by the allocator family.
//!
//! Only recoverable conditions are represented here; structural corruption
//! (validation-token mismatch, double free, overlapping decommit) panics at
//! the point of detection so the crash dump points at the scribbler.

use custom_error::custom_error;

custom_error! {pub AllocationError
    AllocationFailed{size: usize}  = "Couldn't allocate {size} bytes.",
    OutOfAddressSpace{size: usize} = "Couldn't reserve {size} bytes of address space.",
    OutOfMemory{size: usize}       = "No free block fits a request of {size} bytes.",
    InvalidFree{addr: usize}       = "Pointer {addr} is not owned by this allocator.",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let e = AllocationError::OutOfMemory { size: 128 };
        assert_eq!(format!("{}", e), "No free block fits a request of 128 bytes.");
    }
}
