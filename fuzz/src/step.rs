#![no_main]

use libfuzzer_sys::fuzz_target;
use std::collections::VecDeque;
use vm::{Status, Vm, MAX_WORD};

fuzz_target!(|data: &[u8]| {
    // Feed the image back in as keyboard input, so `in` has something to read
    let input: VecDeque<u16> = data.iter().map(|&c| u16::from(c)).collect();
    let mut vm = Vm::new(input, vec![]);
    vm.load(data);

    // Halt if we take more than 65K cycles
    let status = vm.run_until(|_vm, i| i > 65536);
    assert!(vm.pc() <= MAX_WORD, "PC escaped memory: {:#06x}", vm.pc());

    if let Status::Faulted(e) = status {
        // Faults never advance the program counter
        assert_eq!(e.pc(), vm.pc(), "fault {e} reported at the wrong address");

        // Stepping a faulted VM is a no-op
        let pc = vm.pc();
        let stack = vm.stack().len();
        assert_eq!(vm.step(), status);
        assert_eq!(vm.pc(), pc);
        assert_eq!(vm.stack().len(), stack);
    }
});
