//! Workloads aimed at the runtime's distinct subsystems: the dispatch loop,
//! closure upvalues, the class machinery, and the allocator. Each benchmark
//! recompiles and reruns its program on a shared machine, which is how the
//! REPL exercises the interpreter too.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perch::VM;

pub fn arithmetic(c: &mut Criterion) {
    // The telescoping identity keeps the loop body busy without overflow:
    // i*i - (i-1)*(i+1) is always 1.
    let src = r#"
var sum = 0;
for (var i = 1; i <= 20000; i = i + 1) {
  sum = sum + i * i - (i - 1) * (i + 1);
}
if (sum != 20000) print "wrong checksum";
"#;
    c.bench_function("arithmetic", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn closures(c: &mut Criterion) {
    let src = r#"
fun makeCounter() {
  var count = 0;
  fun tick() { count = count + 1; return count; }
  return tick;
}

var tick = makeCounter();
var total = 0;
for (var i = 0; i < 10000; i = i + 1) {
  total = total + tick();
}
if (total != 50005000) print "wrong checksum";
"#;
    c.bench_function("closures", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn mutual_recursion(c: &mut Criterion) {
    let src = r#"
fun isEven(n) { if (n == 0) return true; return isOdd(n - 1); }
fun isOdd(n) { if (n == 0) return false; return isEven(n - 1); }

var misses = 0;
for (var i = 0; i < 2000; i = i + 1) {
  if (!isEven(40)) misses = misses + 1;
}
if (misses > 0) print "wrong checksum";
"#;
    c.bench_function("mutual_recursion", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn string_building(c: &mut Criterion) {
    // Every concatenation makes a fresh string and sends it through the
    // interner; the equality check at the end is an identity comparison.
    let src = r#"
var parts = "";
for (var i = 0; i < 200; i = i + 1) {
  parts = parts + "xy";
}
if (parts + parts != parts + parts) print "interning broke";
"#;
    c.bench_function("string_building", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn linked_list(c: &mut Criterion) {
    let src = r#"
class Node {
  init(value, next) {
    this.value = value;
    this.next = next;
  }
}

var head = nil;
for (var i = 1; i <= 300; i = i + 1) {
  head = Node(i, head);
}

var sum = 0;
var node = head;
while (node != nil) {
  sum = sum + node.value;
  node = node.next;
}
if (sum != 45150) print "wrong checksum";
"#;
    c.bench_function("linked_list", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn state_machine(c: &mut Criterion) {
    // A dimmer wrapping a lamp; composition where a richer dialect would
    // subclass. Every press is two or three method dispatches and a few
    // field reads and writes.
    let src = r#"
class Lamp {
  init() {
    this.lit = false;
    this.flips = 0;
  }
  flip() {
    this.lit = !this.lit;
    this.flips = this.flips + 1;
    return this.lit;
  }
  isLit() { return this.lit; }
}

class Dimmer {
  init(lamp, steps) {
    this.lamp = lamp;
    this.steps = steps;
    this.at = 0;
  }
  press() {
    this.at = this.at + 1;
    if (this.at >= this.steps) {
      this.lamp.flip();
      this.at = 0;
    }
    return this.lamp.isLit();
  }
}

var dimmer = Dimmer(Lamp(), 3);
var lit = false;
for (var i = 0; i < 5000; i = i + 1) {
  lit = dimmer.press();
}
"#;
    c.bench_function("state_machine", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn garbage_churn(c: &mut Criterion) {
    // Each iteration strands the previous instance and string, so the
    // collector gets a steady diet of short-lived objects while `tail`
    // keeps growing.
    let src = r##"
class Box {
  init(v) { this.v = v; }
}

var tail = "";
var last = nil;
for (var i = 0; i < 500; i = i + 1) {
  tail = tail + "#";
  last = Box(tail);
}
if (last.v != tail) print "lost an object";
"##;
    c.bench_function("garbage_churn", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

criterion_group!(
    basics,
    arithmetic,
    closures,
    mutual_recursion,
    string_building,
    linked_list,
    state_machine,
    garbage_churn,
);
criterion_main!(basics);
