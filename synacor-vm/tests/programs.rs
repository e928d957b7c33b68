use std::collections::VecDeque;

use synacor_vm::{Disconnected, Fault, Status, Vm};

const R0: u16 = 32768;
const R1: u16 = 32769;

fn image(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn run(words: &[u16], input: &str) -> Vm<VecDeque<u16>, Vec<u16>> {
    let mut vm = Vm::new(input.bytes().map(u16::from).collect(), vec![]);
    assert!(vm.load(&image(words)).is_empty());
    vm.run_until(|_vm, i| i > 10_000);
    vm
}

fn text(out: &[u16]) -> String {
    out.iter().map(|&c| char::from(c as u8)).collect()
}

#[test]
fn add_then_out() {
    let mut vm = Vm::new(Disconnected, vec![]);
    vm.load(&image(&[9, R0, R1, 4, 19, R0]));

    assert_eq!(vm.step(), Status::Running);
    assert_eq!(vm.register(0), 4);
    assert_eq!(vm.pc(), 4);

    assert_eq!(vm.step(), Status::Running);
    assert_eq!(vm.output(), &[4]);
    assert_eq!(vm.pc(), 6);

    assert_eq!(vm.step(), Status::Halted);
    assert_eq!(vm.pc(), 6);
}

#[test]
fn hello_loop() {
    let mut words = vec![
        1, R0, 100, // set r0 100
        15, R1, R0, // rmem r1 r0
        8, R1, 17, // jf r1 17
        19, R1, // out r1
        9, R0, R0, 1, // add r0 r0 1
        6, 3, // jmp 3
        0, // halt
    ];
    words.resize(100, 0);
    words.extend("Hi!\n".bytes().map(u16::from));
    words.push(0);

    let vm = run(&words, "");
    assert_eq!(vm.status(), Status::Halted);
    assert_eq!(text(vm.output()), "Hi!\n");
    assert_eq!(vm.pc(), 17);
}

#[test]
fn subroutine() {
    let words = [
        17, 6, // call 6
        19, R0, // out r0
        0,  // halt
        21, // noop
        1, R0, 65, // set r0 65
        18, // ret
    ];
    let vm = run(&words, "");
    assert_eq!(vm.status(), Status::Halted);
    assert_eq!(text(vm.output()), "A");
    assert!(vm.stack().is_empty());
    assert_eq!(vm.pc(), 4);
}

#[test]
fn echo_line() {
    let words = [
        20, R0, // in r0
        19, R0, // out r0
        4, R1, R0, 10, // eq r1 r0 10
        8, R1, 0, // jf r1 0
        0, // halt
    ];
    let vm = run(&words, "ab\ncd");
    assert_eq!(vm.status(), Status::Halted);
    assert_eq!(text(vm.output()), "ab\n");

    // Unread input stays in the source
    let (input, _) = vm.into_ports();
    assert_eq!(input.len(), 2);
}

#[test]
fn echo_until_closed() {
    let words = [20, R0, 19, R0, 6, 0];
    let vm = run(&words, "xyz");
    assert_eq!(vm.status(), Status::Faulted(Fault::InputClosed { pc: 0 }));
    assert_eq!(text(vm.output()), "xyz");
}

#[test]
fn stack_round_trip() {
    let words = [
        2, 7, // push 7
        2, 8, // push 8
        3, R0, // pop r0
        3, R1, // pop r1
        18, // ret
    ];
    let vm = run(&words, "");
    assert_eq!(vm.status(), Status::Halted);
    assert_eq!(vm.register(0), 8);
    assert_eq!(vm.register(1), 7);
    assert_eq!(vm.pc(), 8);
}

#[test]
fn self_modifying() {
    let words = [
        16, 5, 0, // wmem 5 0
        21, // noop
        21, // noop
        19, 88, // out 88, overwritten with halt
    ];
    let vm = run(&words, "");
    assert_eq!(vm.status(), Status::Halted);
    assert!(vm.output().is_empty());
    assert_eq!(vm.pc(), 5);
    assert_eq!(vm.memory()[5], 0);
}

#[test]
fn step_limit() {
    let mut vm = Vm::new(Disconnected, Disconnected);
    vm.load(&image(&[6, 0])); // jmp 0
    let status = vm.run_until(|_vm, i| i >= 1000);
    assert_eq!(status, Status::Running);
    assert_eq!(vm.pc(), 0);
}

#[test]
fn fault_stops_run() {
    let words = [
        2, 1, // push 1
        3, R0, // pop r0
        3, R1, // pop r1
        0,
    ];
    let vm = run(&words, "");
    assert_eq!(vm.status(), Status::Faulted(Fault::StackUnderflow { pc: 4 }));
    assert_eq!(vm.register(0), 1);
    assert_eq!(vm.pc(), 4);
    assert_eq!(
        vm.diagnostic().as_deref(),
        Some("pop from empty stack at 0x0004")
    );
}
