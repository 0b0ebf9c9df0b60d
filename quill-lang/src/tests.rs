use std::sync::Arc;

use parking_lot::Mutex;
use refuse::CollectionGuard;
use tracing_subscriber::filter::LevelFilter;

use crate::compiler::syntax::SourceCode;
use crate::runtime::builtins::Module;
use crate::runtime::function::Arity;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::bytecode::{BytecodeBuilder, Opcode};
use crate::vm::{Code, CodeData, ExecutionError, Vm};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

struct Run {
    value: Value,
    text: String,
    output: Vec<String>,
}

fn run(source: &str) -> Run {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let output = Arc::new(Mutex::new(Vec::new()));
    let lines = output.clone();
    vm.context(&mut guard)
        .set_output(move |line| lines.lock().push(line.to_string()));
    let value = vm
        .compile_and_execute(source, &mut guard)
        .unwrap_or_else(|err| panic!("{source}: {err}"));
    let text = value.stringify(&guard);
    let output = output.lock().clone();
    Run {
        value,
        text,
        output,
    }
}

fn raw_code(bytecode: Vec<u8>) -> Code {
    Code::new(CodeData {
        name: Symbol::main_symbol().clone(),
        file: Symbol::from("<raw>"),
        is_async: false,
        params: 0,
        bytecode,
        lines: Vec::new(),
        locals: Vec::new(),
        captures: Vec::new(),
    })
}

#[test]
fn precedence() {
    assert_eq!(run("1 + 2 * 3;").value, Value::Int(7));
    assert_eq!(run("(1 + 2) * 3;").value, Value::Int(9));
}

#[test]
fn overflow_on_literal_boundary() {
    assert_eq!(
        run("var x = 2147483647; x + 1;").value,
        Value::Num(2_147_483_648.0)
    );
}

#[test]
fn program_value_is_last_expression() {
    assert_eq!(run("var a = 1;").value, Value::Null);
    assert_eq!(run("1; 2; var a = 3;").value, Value::Int(2));
}

#[test]
fn inherited_initializer() {
    let run = run(r"
        class A {
            init(x) { this.x = x; }
        }
        class B extends A {
            double() { return this.x * 2; }
        }
        var b = new B(21);
        b.double();
    ");
    assert_eq!(run.value, Value::Int(42));
}

#[test]
fn derived_initializer_chains_explicitly() {
    let run = run(r#"
        class A {
            init(x) { this.x = x; }
        }
        class B extends A {
            init(x, y) {
                A.init(this, x);
                this.y = y;
                return "ignored";
            }
        }
        var b = B(1, 2);
        [b.x, b.y, typeof b];
    "#);
    assert_eq!(run.text, r#"[1, 2, "instance"]"#);
}

#[test]
fn index_out_of_bounds() {
    let run = run("[1, 2, 3][5];");
    assert!(run.value.is_error());
    assert!(run.text.contains("index out of bounds"), "{}", run.text);
    assert!(run.text.contains('5'), "{}", run.text);
    assert!(run.text.contains("<source>:1:"), "{}", run.text);
}

#[test]
fn errors_carry_their_line() {
    let run = run("var a = 1;\nvar b = 0;\na / b;");
    assert_eq!(run.text, "error: <source>:3: division by zero");
}

#[test]
fn closure_capture_isolation() {
    let run = run(r"
        function counter() {
            var n = 0;
            return function () {
                n = n + 1;
                return n;
            };
        }
        var a = counter();
        var b = counter();
        a();
        a();
        b();
        [a(), b()];
    ");
    assert_eq!(run.text, "[3, 2]");
}

#[test]
fn closures_share_captured_cells() {
    let run = run(r"
        function pair() {
            var value = 0;
            return {
                get: function () { return value; },
                set: function (v) { value = v; },
            };
        }
        var p = pair();
        p.set(7);
        p.get();
    ");
    assert_eq!(run.value, Value::Int(7));
}

#[test]
fn arity_mismatch_keeps_the_stack_balanced() {
    let run = run(r"
        function f(a) { return a; }
        var values = [1, 2, f(1, 2), 4];
        [len(values), is_error(values[2]), values[3]];
    ");
    assert_eq!(run.text, "[4, true, 4]");
}

#[test]
fn calling_non_callables() {
    let run = run("var x = 1; x();");
    assert!(run.text.contains("int is not callable"), "{}", run.text);
    let run = self::run("var x = 1; new x();");
    assert!(run.text.contains("int is not a class"), "{}", run.text);
}

#[test]
fn recursion() {
    let run = run(r"
        print(fib(15));
        function fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
    ");
    assert_eq!(run.output, ["610"]);
}

#[test]
fn loops_and_jumps() {
    assert_eq!(
        run(r"
            var sum = 0;
            for (var i = 0; i < 10; i++) {
                if (i % 2 == 0) continue;
                if (i > 7) break;
                sum += i;
            }
            sum;
        ")
        .value,
        Value::Int(16)
    );
    assert_eq!(
        run("var i = 0; do { i++; } while (i < 5); i;").value,
        Value::Int(5)
    );
    assert_eq!(
        run(r"
            var i = 0;
            var total = 0;
            while (true) {
                i++;
                if (i > 3) break;
                var j = 0;
                do {
                    j++;
                    if (j == 2) continue;
                    total += j;
                } while (j < 3);
            }
            total;
        ")
        .value,
        Value::Int(12)
    );
}

#[test]
fn switch_falls_through() {
    let source = |subject: &str| {
        format!(
            r#"
            var out = [];
            switch ({subject}) {{
                case 1:
                    push(out, "one");
                case 2:
                    push(out, "two");
                    break;
                default:
                    push(out, "other");
                case 3:
                    push(out, "three");
            }}
            out;
            "#
        )
    };
    assert_eq!(run(&source("1")).text, r#"["one", "two"]"#);
    assert_eq!(run(&source("2")).text, r#"["two"]"#);
    assert_eq!(run(&source("3")).text, r#"["three"]"#);
    assert_eq!(run(&source("4")).text, r#"["other", "three"]"#);
}

#[test]
fn compound_and_update_assignments() {
    assert_eq!(
        run(r#"var o = {a: 1}; o.a += 2; o["a"]++; ++o.a; o.a;"#).value,
        Value::Int(5)
    );
    assert_eq!(
        run("var arr = [5]; var old = arr[0]++; [old, arr[0], --arr[0]];").text,
        "[5, 6, 5]"
    );
    assert_eq!(
        run("var x = 1; var y = x++; var z = ++x; [x, y, z];").text,
        "[3, 1, 3]"
    );
}

#[test]
fn logical_operators() {
    assert_eq!(run("0 || 5;").value, Value::Int(5));
    assert_eq!(run("1 && 0;").value, Value::Int(0));
    assert_eq!(run("null ?? 3;").value, Value::Int(3));
    assert_eq!(run("0 ?? 3;").value, Value::Int(0));
    assert_eq!(run("[1][5] catch 7;").value, Value::Int(7));
    assert_eq!(run("1 catch 7;").value, Value::Int(1));
    assert_eq!(run("true ? 1 : 2;").value, Value::Int(1));
}

#[test]
fn errors_propagate() {
    let run = run("var e = error(\"boom\"); [typeof (e + 1), str(-e), e(1)];");
    assert_eq!(run.text, r#"["error", "error: boom", error: boom]"#);
}

#[test]
fn enums() {
    assert_eq!(
        run("enum Color { Red, Green = 5, Blue } [Color.Red, Color.Green, Color.Blue];").text,
        "[0, 5, 6]"
    );
    assert!(run("enum Color { Red } Color.Red = 2;")
        .text
        .contains("cannot modify frozen enum"));
    assert!(run("enum Dup { A = 1, B = 1 } Dup;")
        .text
        .contains("duplicate enum value: B"));
}

#[test]
fn modules() {
    let run = run(r"
        module util {
            var base = 10;
            function add(x) { return x + base; }
        }
        import util as u;
        import math;
        [util.add(5), u.add(1), math.max(2, 3) + math.floor(2.5), is_error(util.base = 1)];
    ");
    assert_eq!(run.text, "[15, 11, 5, true]");
}

#[test]
fn unknown_module() {
    let run = run("import missing; missing;");
    assert!(run.text.contains("unknown module: missing"), "{}", run.text);
}

#[test]
fn registered_modules() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    vm.register_module(
        Module::new("host")
            .with_constant("version", 3)
            .with_function("twice", Arity::Fixed(1), |_context, args| match args[0] {
                Value::Int(value) => Ok(Value::Int(value * 2)),
                _ => Ok(Value::Null),
            }),
        &mut guard,
    );
    let value = vm
        .compile_and_execute("import host; host.twice(host.version);", &mut guard)
        .unwrap();
    assert_eq!(value, Value::Int(6));
}

#[test]
fn native_methods() {
    let run = run(r#"var a = [1]; a.push(2); [a.len(), "ab".upper(), "AB".lower(), a.pop(), len(a)];"#);
    assert_eq!(run.text, r#"[2, "AB", "ab", 2, 1]"#);
}

#[test]
fn print_joins_arguments() {
    let run = run(r#"print("a", 1, null, [true]);"#);
    assert_eq!(run.output, ["a 1 null [true]"]);
}

#[test]
fn await_resumes_in_fifo_order() {
    initialize_tracing();
    let run = run(r#"
        async function a() {
            var v = await defer(1);
            print("a", v);
            return v + 1;
        }
        async function b() {
            var v = await defer(2);
            print("b", v);
            return v * 10;
        }
        async function both() {
            var x = await a();
            var y = await b();
            print("both", x, y);
            return x + y;
        }
        var pa = a();
        var pb = b();
        var pc = both();
        print("main");
        [pa, pb, pc];
    "#);
    assert_eq!(run.output, ["main", "a 1", "b 2", "a 1", "b 2", "both 2 20"]);
    assert_eq!(
        run.text,
        "[<promise fulfilled: 2>, <promise fulfilled: 20>, <promise fulfilled: 22>]"
    );
}

#[test]
fn async_without_suspension() {
    initialize_tracing();
    let run = run(r"
        async function ready() { return 5; }
        async function outer() { return await ready() + 1; }
        outer();
    ");
    assert_eq!(run.text, "<promise fulfilled: 6>");
}

#[test]
fn rejected_promises() {
    initialize_tracing();
    let run = run(r#"
        async function fails() { return error("nope"); }
        async function catches() { return await fails() catch "handled"; }
        [fails(), catches()];
    "#);
    assert_eq!(
        run.text,
        r#"[<promise rejected: error: nope>, <promise fulfilled: "handled">]"#
    );
}

#[test]
fn invalid_opcode() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    assert_eq!(
        vm.execute(&raw_code(vec![0xFF]), &mut guard).unwrap_err(),
        ExecutionError::InvalidOpcode {
            offset: 0,
            byte: 0xFF
        }
    );
}

#[test]
fn truncated_operand() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    assert_eq!(
        vm.execute(&raw_code(vec![Opcode::LoadInt as u8, 1, 0]), &mut guard)
            .unwrap_err(),
        ExecutionError::TruncatedInstruction { offset: 1 }
    );
}

#[test]
fn stack_imbalance_on_return() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let mut code = BytecodeBuilder::default();
    code.emit(Opcode::LoadNull);
    code.emit(Opcode::LoadNull);
    code.emit(Opcode::Return);
    let (bytecode, _) = code.finish();
    assert_eq!(
        vm.execute(&raw_code(bytecode), &mut guard).unwrap_err(),
        ExecutionError::StackImbalance {
            function: String::from("main"),
            depth: 1
        }
    );
}

#[test]
fn stack_overflow() {
    initialize_tracing();
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    vm.context(&mut guard).set_max_depth(64);
    let err = vm
        .compile_and_execute("function f(n) { return f(n + 1); } f(0);", &mut guard)
        .unwrap_err();
    assert_eq!(
        err,
        crate::Error::Execution(ExecutionError::StackOverflow)
    );
    // The virtual machine is still usable afterwards.
    let value = vm.compile_and_execute("1 + 1;", &mut guard).unwrap();
    assert_eq!(value, Value::Int(2));
}

#[test]
fn collector_yields_during_execution() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    vm.context(&mut guard).set_steps_per_charge(1);
    let value = vm
        .compile_and_execute(
            r"
            var items = [];
            for (var i = 0; i < 200; i++) {
                push(items, {index: i, label: str(i)});
            }
            items[199].label;
            ",
            &mut guard,
        )
        .unwrap();
    assert_eq!(value.stringify(&guard), "199");
}

#[test]
fn disassembly_lists_instructions() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let code = vm
        .compile(SourceCode::new("math.q", "var a = 1;\na + 2;"), &mut guard)
        .unwrap();
    let listing = code.disassemble();
    assert!(listing.contains("main"), "{listing}");
    assert!(listing.contains("math.q"), "{listing}");
    assert!(listing.contains("LoadInt"), "{listing}");
    assert!(listing.contains("Add"), "{listing}");
}
