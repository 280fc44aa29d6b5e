#![no_main]

use libfuzzer_sys::fuzz_target;
use dotshim::{
    assembly::decode_stream,
    isolation::{rewrite, IsolationConfig, RunContext},
    metadata::{
        builders::{MethodDefBuilder, TypeDefBuilder},
        method::encode_method_body,
        Module, SymbolTable,
    },
};

fuzz_target!(|data: &[u8]| {
    if decode_stream(data).is_err() {
        return;
    }

    let module = Module::new();
    let Ok(class) = TypeDefBuilder::new("Fuzz", "Program").build(&module) else {
        return;
    };
    let Ok(method) = MethodDefBuilder::new("Target").static_method().build(&module, class) else {
        return;
    };
    let Ok(body) = encode_method_body(data, 8, 0, false, &[]) else {
        return;
    };
    if module.set_body(method, body).is_err() {
        return;
    }
    let Ok(method) = module.method(method) else {
        return;
    };

    let context = RunContext::new(Vec::new(), IsolationConfig::strict());
    let _ = rewrite(&context, &module, &method, false);
});
