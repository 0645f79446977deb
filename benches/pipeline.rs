use criterion::{Criterion, black_box, criterion_group, criterion_main};

use vee::output::CaptureSink;
use vee::vm::Vm;
use vee::{compiler, ir, lexer, parser};

const WORKLOADS: [(&str, &str); 2] = [
    ("fib", "tests/programs/fib.vee"),
    ("loops", "tests/programs/loops.vee"),
];

fn load_source(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

fn bench_frontend(c: &mut Criterion) {
    for (label, path) in WORKLOADS {
        let source = load_source(path);

        c.bench_function(&format!("tokenize_{label}"), |b| {
            b.iter(|| {
                let out = lexer::tokenize(black_box(&source));
                black_box(out);
            })
        });

        c.bench_function(&format!("parse_{label}"), |b| {
            b.iter(|| {
                let tokens = lexer::tokenize(black_box(&source));
                let out = parser::parse(tokens).expect("parse");
                black_box(out);
            })
        });
    }
}

fn bench_compile(c: &mut Criterion) {
    for (label, path) in WORKLOADS {
        let source = load_source(path);
        let ast = parser::parse(lexer::tokenize(&source)).expect("parse");

        c.bench_function(&format!("compile_{label}"), |b| {
            b.iter(|| {
                let out = compiler::compile(black_box(&ast)).expect("compile");
                black_box(out);
            })
        });
    }
}

fn bench_execute(c: &mut Criterion) {
    for (label, path) in WORKLOADS {
        let source = load_source(path);
        let ast = parser::parse(lexer::tokenize(&source)).expect("parse");
        let text = compiler::compile(&ast).expect("compile");
        let program = ir::load(&text);

        c.bench_function(&format!("execute_{label}"), |b| {
            b.iter(|| {
                let (sink, buffer) = CaptureSink::new();
                let mut vm = Vm::new(Box::new(sink));
                vm.run(black_box(&program)).expect("run");
                black_box(buffer.borrow().len());
            })
        });
    }
}

criterion_group!(benches, bench_frontend, bench_compile, bench_execute);
criterion_main!(benches);
