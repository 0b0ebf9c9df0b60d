use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use quill::compiler::syntax::Ranged;
use quill::compiler::Error;
use quill::refuse::CollectionGuard;
use quill::runtime::value::Value;
use quill::vm::Vm;
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum TestOutput {
    Null,
    Bool(bool),
    Int(i32),
    Num(f64),
    Str(String),
    Error(String),
    Other(String),
    Compilation(Vec<Ranged<Error>>),
    Execution(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Case {
    pub src: String,
    pub output: TestOutput,
    #[serde(default)]
    pub printed: Vec<String>,
}

impl Case {
    fn run(&self) -> (TestOutput, Vec<String>) {
        let mut guard = CollectionGuard::acquire();
        let vm = Vm::new(&guard);
        let mut context = vm.context(&mut guard);
        let printed = Arc::new(Mutex::new(Vec::new()));
        context.set_output({
            let printed = printed.clone();
            move |line| printed.lock().push(line.to_string())
        });

        let output = match context.compile(&self.src) {
            Ok(code) => match context.execute(&code) {
                Ok(Value::Null) => TestOutput::Null,
                Ok(Value::Bool(value)) => TestOutput::Bool(value),
                Ok(Value::Int(value)) => TestOutput::Int(value),
                Ok(Value::Num(value)) => TestOutput::Num(value),
                Ok(value @ Value::Str(_)) => TestOutput::Str(value.stringify(context.guard())),
                Ok(value) if value.is_error() => {
                    let text = value.stringify(context.guard());
                    TestOutput::Error(
                        text.strip_prefix("error: ")
                            .map_or_else(|| text.clone(), str::to_string),
                    )
                }
                Ok(value) => TestOutput::Other(value.stringify(context.guard())),
                Err(err) => TestOutput::Execution(err.to_string()),
            },
            Err(errors) => TestOutput::Compilation(errors),
        };
        let printed = std::mem::take(&mut *printed.lock());
        (output, printed)
    }
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    for entry in std::fs::read_dir("tests/cases").unwrap() {
        let entry = entry.unwrap().path();
        if entry.extension().map_or(false, |ext| ext == "rsn") {
            run_test_cases(&entry);
        }
    }
}

fn run_test_cases(path: &Path) {
    let contents = std::fs::read_to_string(path).unwrap();

    let cases: BTreeMap<String, Case> = match rsn::parser::Config::default()
        .allow_implicit_map(true)
        .deserialize(&contents)
    {
        Ok(cases) => cases,
        Err(err) => unreachable!("error parsing {}: {err}", path.display()),
    };
    for (name, case) in cases {
        println!("Running {name}");
        let (output, printed) = case.run();
        assert_eq!(
            output,
            case.output,
            "in {path} @ {name}: expected {expected:?}, got {output:?}",
            path = path.display(),
            expected = case.output
        );
        assert_eq!(
            printed,
            case.printed,
            "in {path} @ {name}: unexpected output",
            path = path.display(),
        );
    }
}
