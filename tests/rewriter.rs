// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Rewritten bodies executed end to end: exception regions, value types, interface
//! dispatch and delegates.

use std::sync::Arc;

use dotshim::{
    emulation::{NativeMethod, Runtime, Value},
    isolation::{rewrite, IsolationConfig, IsolationRun, RunContext, Shim},
    metadata::{
        builders::{FieldDefBuilder, MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
        method::ExceptionRegionKind,
        Module, SymbolTable, Token, TypeSig,
    },
    Error, Result,
};

struct Program {
    module: Module,
    class: Token,
}

impl Program {
    fn new() -> Result<Self> {
        let module = Module::new();
        let class = TypeDefBuilder::new("Tests", "Program").build(&module)?;
        Ok(Program { module, class })
    }

    fn method(&self, name: &str, returns: TypeSig, body: MethodBodyBuilder) -> Result<Token> {
        MethodDefBuilder::new(name)
            .static_method()
            .returns(returns)
            .body(body)
            .build(&self.module, self.class)
    }

    fn exception_ctors(&self, exception: Token) -> Result<(Token, Token)> {
        self.module
            .corlib()
            .exception_constructors(exception)
            .ok_or(Error::TypeNotFound(exception))
    }

    /// `Console.WriteLine(string)` replaced by an upper-casing variant.
    fn shouting(&self) -> Result<Shim> {
        let write_line = self.module.corlib().console_write_line_string;
        Shim::replace(&self.module, write_line)?.with_native(
            &self.module,
            NativeMethod::new("shout", vec![TypeSig::String], TypeSig::Void, move |thread, args| {
                let runtime = thread.runtime();
                let text = runtime.string_value(&args[0])?.unwrap_or_else(|| "".into());
                let loud = runtime.alloc_string(&text.to_uppercase())?;
                let original = runtime.symbols().method(write_line)?;
                thread.call_method(&original, vec![loud])
            }),
        )
    }

    fn runtime(self) -> Runtime {
        Runtime::new(Arc::new(self.module))
    }
}

#[test]
fn nested_regions_survive_rewriting() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let caught = program.module.add_user_string("caught");
    let finally = program.module.add_user_string("finally");
    let after = program.module.add_user_string("after");
    let write_line = corlib.console_write_line_string;

    let fail = program.method(
        "Fail",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.newobj(invalid_operation)?.throw()?;
            Ok(())
        }),
    )?;
    let guarded = program.method(
        "Guarded",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.try_start("outer")?
                .try_start("inner")?
                .call(fail)?
                .leave_s("inner_end")?
                .try_end("inner")?
                .catch_start("inner", corlib.exception)?
                .pop()?
                .ldstr(caught)?
                .call(write_line)?
                .leave_s("inner_end")?
                .catch_end("inner")?
                .label("inner_end")?
                .leave_s("outer_end")?
                .try_end("outer")?
                .finally_start("outer")?
                .ldstr(finally)?
                .call(write_line)?
                .endfinally()?
                .finally_end("outer")?
                .label("outer_end")?
                .ldstr(after)?
                .call(write_line)?
                .ret()?;
            Ok(())
        }),
    )?;
    let shim = program.shouting()?;

    let original = program.module.method(guarded)?;
    let context = RunContext::new(Vec::new(), IsolationConfig::strict());
    let rewritten = rewrite(&context, &program.module, &original, false)?;
    let kinds: Vec<_> = rewritten
        .decoded()
        .exception_regions
        .iter()
        .map(|clause| clause.kind())
        .collect();
    assert_eq!(kinds, [ExceptionRegionKind::Catch, ExceptionRegionKind::Finally]);
    let regions = &rewritten.decoded().exception_regions;
    assert!(regions[1].try_offset <= regions[0].try_offset);
    assert!(regions[1].try_offset + regions[1].try_length >= regions[0].handler_end());

    let runtime = program.runtime();
    IsolationRun::new(&runtime, vec![shim])?.invoke(guarded, vec![])?;
    assert_eq!(runtime.console().lines(), vec!["CAUGHT", "FINALLY", "AFTER"]);
    Ok(())
}

#[test]
fn catch_clauses_after_rewriting() -> Result<()> {
    let program = Program::new()?;
    let divide_by_zero = program.module.corlib().divide_by_zero_exception;
    let guarded = program.method(
        "Guarded",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.try_start("guard")?
                    .ldc_i4_1()?
                    .ldc_i4_0()?
                    .div()?
                    .stloc_0()?
                    .leave_s("done")?
                    .try_end("guard")?
                    .catch_start("guard", divide_by_zero)?
                    .pop()?
                    .ldc_i4_7()?
                    .stloc_0()?
                    .leave_s("done")?
                    .catch_end("guard")?
                    .label("done")?
                    .ldloc_0()?
                    .ret()?;
                Ok(())
            }),
    )?;

    let runtime = program.runtime();
    let run = IsolationRun::with_config(&runtime, vec![], IsolationConfig::strict())?;
    assert_eq!(run.invoke(guarded, vec![])?, Value::I4(7));
    Ok(())
}

#[test]
fn filters_after_rewriting() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let filtered = program.method(
        "Filtered",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.try_start("guard")?
                    .newobj(invalid_operation)?
                    .throw()?
                    .try_end("guard")?
                    .filter_start("guard")?
                    .isinst(corlib.invalid_operation_exception)?
                    .ldnull()?
                    .cgt_un()?
                    .endfilter()?
                    .filter_handler_start("guard")?
                    .pop()?
                    .ldc_i4_1()?
                    .stloc_0()?
                    .leave_s("done")?
                    .filter_end("guard")?
                    .label("done")?
                    .ldloc_0()?
                    .ret()?;
                Ok(())
            }),
    )?;

    let runtime = program.runtime();
    let run = IsolationRun::with_config(&runtime, vec![], IsolationConfig::strict())?;
    assert_eq!(run.invoke(filtered, vec![])?, Value::I4(1));
    Ok(())
}

#[test]
fn unhandled_exceptions_escape_the_run() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (_, invalid_operation) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let reason = program.module.add_user_string("bad state");
    let fail = program.method(
        "Fail",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldstr(reason)?.newobj(invalid_operation)?.throw()?;
            Ok(())
        }),
    )?;

    let runtime = program.runtime();
    let run = IsolationRun::new(&runtime, vec![])?;
    match run.invoke(fail, vec![]) {
        Err(Error::ManagedException { type_name, message }) => {
            assert_eq!(type_name, "System.InvalidOperationException");
            assert_eq!(message, "bad state");
        }
        other => panic!("expected a managed exception, got {other:?}"),
    }
    Ok(())
}

struct Points {
    program: Program,
    sum: Token,
    entry: Token,
}

/// `Point(x, y)` with `Sum()`; the entry builds two points, one through `call .ctor`
/// on a local and one through `newobj`, and returns `first.Sum() + second.X`.
fn points() -> Result<Points> {
    let program = Program::new()?;
    let module = &program.module;
    let point = TypeDefBuilder::new("Tests", "Point").value_type().build(module)?;
    let x = FieldDefBuilder::new("X", TypeSig::I4).build(module, point)?;
    let y = FieldDefBuilder::new("Y", TypeSig::I4).build(module, point)?;
    let ctor = MethodDefBuilder::constructor()
        .param(TypeSig::I4)
        .param(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldarg_0()?
                .ldarg_1()?
                .stfld(x)?
                .ldarg_0()?
                .ldarg_2()?
                .stfld(y)?
                .ret()?;
            Ok(())
        }))
        .build(module, point)?;
    let sum = MethodDefBuilder::new("Sum")
        .returns(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldarg_0()?
                .ldfld(x)?
                .ldarg_0()?
                .ldfld(y)?
                .add()?
                .ret()?;
            Ok(())
        }))
        .build(module, point)?;

    let entry = program.method(
        "Points",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::ValueType(point))
            .local(TypeSig::ValueType(point))
            .implementation(move |asm| {
                asm.ldloca(0)?
                    .ldc_i4_3()?
                    .ldc_i4_4()?
                    .call(ctor)?
                    .ldloca(0)?
                    .call(sum)?
                    .ldc_i4_5()?
                    .ldc_i4_6()?
                    .newobj(ctor)?
                    .stloc_1()?
                    .ldloca(1)?
                    .ldfld(x)?
                    .add()?
                    .ret()?;
                Ok(())
            }),
    )?;
    Ok(Points {
        program,
        sum,
        entry,
    })
}

#[test]
fn value_types_after_rewriting() -> Result<()> {
    let Points { program, entry, .. } = points()?;
    let runtime = program.runtime();
    let run = IsolationRun::with_config(&runtime, vec![], IsolationConfig::strict())?;
    assert_eq!(run.invoke(entry, vec![])?, Value::I4(12));
    Ok(())
}

#[test]
fn value_type_methods_can_be_shimmed() -> Result<()> {
    let Points {
        program,
        sum,
        entry,
    } = points()?;
    let point = program.module.method(sum)?.declaring_type;
    let shim = Shim::replace(&program.module, sum)?.with_native(
        &program.module,
        NativeMethod::new(
            "sum",
            vec![TypeSig::ValueType(point).by_ref()],
            TypeSig::I4,
            |_, _| Ok(Value::I4(100)),
        ),
    )?;

    let runtime = program.runtime();
    let run = IsolationRun::new(&runtime, vec![shim])?;
    assert_eq!(run.invoke(entry, vec![])?, Value::I4(105));
    Ok(())
}

struct Named {
    program: Program,
    constrained: Token,
    boxed: Token,
    class_instance: Token,
}

/// `INamed.Name()` implemented by the value type `Tag` (returning its `id` field) and
/// by the class `Label` (returning 4).
fn named() -> Result<Named> {
    let program = Program::new()?;
    let module = &program.module;
    let object_ctor = module.corlib().object_ctor;
    let named = TypeDefBuilder::new("Tests", "INamed").interface().build(module)?;
    let name = MethodDefBuilder::new("Name")
        .returns(TypeSig::I4)
        .build(module, named)?;

    let tag = TypeDefBuilder::new("Tests", "Tag")
        .value_type()
        .implements(named)
        .build(module)?;
    let id = FieldDefBuilder::new("id", TypeSig::I4).build(module, tag)?;
    MethodDefBuilder::new("Name")
        .virtual_method()
        .final_method()
        .returns(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldarg_0()?.ldfld(id)?.ret()?;
            Ok(())
        }))
        .build(module, tag)?;

    let label = TypeDefBuilder::new("Tests", "Label")
        .implements(named)
        .build(module)?;
    let label_ctor = MethodDefBuilder::constructor()
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldarg_0()?.call(object_ctor)?.ret()?;
            Ok(())
        }))
        .build(module, label)?;
    MethodDefBuilder::new("Name")
        .virtual_method()
        .final_method()
        .returns(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(|asm| {
            asm.ldc_i4_4()?.ret()?;
            Ok(())
        }))
        .build(module, label)?;

    let with_tag = |name_of: &str, boxed: bool| {
        program.method(
            name_of,
            TypeSig::I4,
            MethodBodyBuilder::new()
                .local(TypeSig::ValueType(tag))
                .implementation(move |asm| {
                    asm.ldloca(0)?.ldc_i4_s(9)?.stfld(id)?;
                    if boxed {
                        asm.ldloc_0()?.box_(tag)?.callvirt(name)?.ret()?;
                    } else {
                        asm.ldloca(0)?.constrained(tag)?.callvirt(name)?.ret()?;
                    }
                    Ok(())
                }),
        )
    };
    let constrained = with_tag("Constrained", false)?;
    let boxed = with_tag("Boxed", true)?;
    let class_instance = program.method(
        "ClassInstance",
        TypeSig::I4,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.newobj(label_ctor)?.callvirt(name)?.ret()?;
            Ok(())
        }),
    )?;

    Ok(Named {
        program,
        constrained,
        boxed,
        class_instance,
    })
}

#[test]
fn interface_dispatch_after_rewriting() -> Result<()> {
    let Named {
        program,
        constrained,
        boxed,
        class_instance,
    } = named()?;
    let runtime = program.runtime();
    let run = IsolationRun::with_config(&runtime, vec![], IsolationConfig::strict())?;

    assert_eq!(run.invoke(constrained, vec![])?, Value::I4(9));
    assert_eq!(run.invoke(boxed, vec![])?, Value::I4(9));
    assert_eq!(run.invoke(class_instance, vec![])?, Value::I4(4));
    Ok(())
}

#[test]
fn delegates_bind_rewritten_targets() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let hello = program.module.add_user_string("hello");
    let greet = program.method(
        "Greet",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldstr(hello)?
                .call(corlib.console_write_line_string)?
                .ret()?;
            Ok(())
        }),
    )?;
    let corlib = program.module.corlib().clone();
    let invoke = program.method(
        "Invoke",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldnull()?
                .ldftn(greet)?
                .newobj(corlib.action_ctor)?
                .callvirt(corlib.action_invoke)?
                .ret()?;
            Ok(())
        }),
    )?;
    let shim = program.shouting()?;

    let runtime = program.runtime();
    let run = IsolationRun::new(&runtime, vec![shim])?;
    run.invoke(invoke, vec![])?;
    assert_eq!(runtime.console().lines(), vec!["HELLO"]);

    let greet = runtime.symbols().method(greet)?.identity();
    assert!(run.context().cache().body(&greet, false).is_some());
    Ok(())
}
