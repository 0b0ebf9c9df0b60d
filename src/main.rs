use std::process::ExitCode;

use ariadne::{Label, Report, ReportKind, Source};
use quill::compiler::syntax::{Ranged, SourceCode};
use quill::refuse::CollectionGuard;
use quill::runtime::value::Value;
use quill::vm::Vm;
use quill::{compiler, ErrorKind};

const USAGE: &str = "usage: quill [--disassemble] <path>";

fn main() -> ExitCode {
    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut disassemble = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        if arg == "--disassemble" {
            disassemble = true;
        } else if path.is_none() {
            path = Some(arg);
        } else {
            eprintln!("{USAGE}");
            return ExitCode::from(1);
        }
    }
    let Some(path) = path else {
        eprintln!("{USAGE}");
        return ExitCode::from(1);
    };
    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::from(1);
        }
    };

    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let mut context = vm.context(&mut guard);
    let code = match context.compile(SourceCode::new(&path, &source)) {
        Ok(code) => code,
        Err(errors) => {
            report(&path, &source, &errors);
            return ExitCode::from(1);
        }
    };

    if disassemble {
        for function in context.functions() {
            println!("{}", function.disassemble());
        }
        println!("{}", code.disassemble());
        return ExitCode::SUCCESS;
    }

    match context.execute(&code) {
        Ok(value) if value.is_error() => {
            eprintln!("{}", value.stringify(context.guard()));
            ExitCode::from(2)
        }
        Ok(Value::Null) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{}", value.stringify(context.guard()));
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("execution error: {err}");
            ExitCode::from(3)
        }
    }
}

fn report(path: &str, source: &str, errors: &[Ranged<compiler::Error>]) {
    for error in errors {
        let range = error.range();
        let result = Report::build(ReportKind::Error, path, range.start)
            .with_message(error.kind())
            .with_label(Label::new((path, range.start..range.end())).with_message(&error.0))
            .finish()
            .eprint((path, Source::from(source.to_string())));
        if let Err(err) = result {
            eprintln!("{}: {} at {}", error.kind(), error.0, range.start);
            eprintln!("error writing diagnostic: {err}");
        }
    }
}
