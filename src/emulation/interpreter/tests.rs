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


use std::sync::Arc;

use crate::{
    emulation::{config::RuntimeLimits, runtime::Runtime, value::Value},
    metadata::{
        builders::{FieldDefBuilder, MethodBodyBuilder, MethodDefBuilder, TypeDefBuilder},
        Module, Token, TypeSig,
    },
    Error, Result,
};

struct Program {
    module: Arc<Module>,
    class: Token,
}

impl Program {
    fn new() -> Result<Self> {
        let module = Arc::new(Module::new());
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

    /// `(.ctor(), .ctor(string))` of a core exception type.
    fn exception_ctors(&self, exception: Token) -> Result<(Token, Token)> {
        self.module
            .corlib()
            .exception_constructors(exception)
            .ok_or(Error::TypeNotFound(exception))
    }

    fn runtime(&self) -> Runtime {
        Runtime::new(self.module.clone())
    }
}

#[test]
fn loops_and_arithmetic() -> Result<()> {
    let program = Program::new()?;
    let sum = program.method(
        "Sum",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .local(TypeSig::I4)
            .implementation(|asm| {
                asm.ldc_i4_1()?
                    .stloc_0()?
                    .ldc_i4_0()?
                    .stloc_1()?
                    .label("loop")?
                    .ldloc_0()?
                    .ldc_i4_s(10)?
                    .bgt_s("done")?
                    .ldloc_1()?
                    .ldloc_0()?
                    .add()?
                    .stloc_1()?
                    .ldloc_0()?
                    .ldc_i4_1()?
                    .add()?
                    .stloc_0()?
                    .br_s("loop")?
                    .label("done")?
                    .ldloc_1()?
                    .ret()?;
                Ok(())
            }),
    )?;

    assert_eq!(program.runtime().invoke(sum, vec![])?, Value::I4(55));
    Ok(())
}

#[test]
fn arguments_are_passed_in_order() -> Result<()> {
    let program = Program::new()?;
    let subtract = MethodDefBuilder::new("Subtract")
        .static_method()
        .param(TypeSig::I4)
        .param(TypeSig::I4)
        .returns(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(|asm| {
            asm.ldarg_0()?.ldarg_1()?.sub()?.ret()?;
            Ok(())
        }))
        .build(&program.module, program.class)?;
    let caller = program.method(
        "Caller",
        TypeSig::I4,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldc_i4_s(50)?.ldc_i4_8()?.call(subtract)?.ret()?;
            Ok(())
        }),
    )?;

    assert_eq!(program.runtime().invoke(caller, vec![])?, Value::I4(42));
    Ok(())
}

#[test]
fn catch_divide_by_zero() -> Result<()> {
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

    assert_eq!(program.runtime().invoke(guarded, vec![])?, Value::I4(7));
    Ok(())
}

#[test]
fn exceptions_cross_frames() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let fail = program.method(
        "Fail",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.newobj(invalid_operation)?.throw()?;
            Ok(())
        }),
    )?;
    let caller = program.method(
        "Caller",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.try_start("guard")?
                    .call(fail)?
                    .leave_s("done")?
                    .try_end("guard")?
                    .catch_start("guard", corlib.exception)?
                    .pop()?
                    .ldc_i4_3()?
                    .stloc_0()?
                    .leave_s("done")?
                    .catch_end("guard")?
                    .label("done")?
                    .ldloc_0()?
                    .ret()?;
                Ok(())
            }),
    )?;

    assert_eq!(program.runtime().invoke(caller, vec![])?, Value::I4(3));
    Ok(())
}

#[test]
fn finally_runs_on_leave() -> Result<()> {
    let program = Program::new()?;
    let write_line = program.module.corlib().console_write_line_string;
    let body = program.module.add_user_string("body");
    let finally = program.module.add_user_string("finally");
    let after = program.module.add_user_string("after");
    let method = program.method(
        "Ordered",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.try_start("guard")?
                .ldstr(body)?
                .call(write_line)?
                .leave_s("done")?
                .try_end("guard")?
                .finally_start("guard")?
                .ldstr(finally)?
                .call(write_line)?
                .endfinally()?
                .finally_end("guard")?
                .label("done")?
                .ldstr(after)?
                .call(write_line)?
                .ret()?;
            Ok(())
        }),
    )?;

    let runtime = program.runtime();
    assert_eq!(runtime.invoke(method, vec![])?, Value::Void);
    assert_eq!(runtime.console().lines(), vec!["body", "finally", "after"]);
    Ok(())
}

#[test]
fn finally_runs_while_unwinding() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (_, invalid_operation) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let reason = program.module.add_user_string("bad state");
    let cleanup = program.module.add_user_string("cleanup");
    let method = program.method(
        "Unwind",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.try_start("guard")?
                .ldstr(reason)?
                .newobj(invalid_operation)?
                .throw()?
                .try_end("guard")?
                .finally_start("guard")?
                .ldstr(cleanup)?
                .call(corlib.console_write_line_string)?
                .endfinally()?
                .finally_end("guard")?
                .ret()?;
            Ok(())
        }),
    )?;

    let runtime = program.runtime();
    match runtime.invoke(method, vec![]) {
        Err(Error::ManagedException { type_name, message }) => {
            assert_eq!(type_name, "System.InvalidOperationException");
            assert_eq!(message, "bad state");
        }
        other => panic!("expected a managed exception, got {other:?}"),
    }
    assert_eq!(runtime.console().lines(), vec!["cleanup"]);
    Ok(())
}

#[test]
fn filters_select_handlers() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let method = program.method(
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

    assert_eq!(program.runtime().invoke(method, vec![])?, Value::I4(1));
    Ok(())
}

#[test]
fn rejecting_filter_lets_exception_escape() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let method = program.method(
        "Rejected",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.try_start("guard")?
                .newobj(invalid_operation)?
                .throw()?
                .try_end("guard")?
                .filter_start("guard")?
                .pop()?
                .ldc_i4_0()?
                .endfilter()?
                .filter_handler_start("guard")?
                .pop()?
                .leave_s("done")?
                .filter_end("guard")?
                .label("done")?
                .ret()?;
            Ok(())
        }),
    )?;

    assert!(matches!(
        program.runtime().invoke(method, vec![]),
        Err(Error::ManagedException { type_name, .. }) if type_name == "System.InvalidOperationException"
    ));
    Ok(())
}

#[test]
fn exception_in_finally_replaces_original() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (invalid_operation, _) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let (divide_by_zero, _) = program.exception_ctors(corlib.divide_by_zero_exception)?;
    let method = program.method(
        "Replaced",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::I4)
            .implementation(move |asm| {
                asm.try_start("outer")?
                    .try_start("inner")?
                    .newobj(invalid_operation)?
                    .throw()?
                    .try_end("inner")?
                    .finally_start("inner")?
                    .newobj(divide_by_zero)?
                    .throw()?
                    .finally_end("inner")?
                    .try_end("outer")?
                    .catch_start("outer", corlib.invalid_operation_exception)?
                    .pop()?
                    .ldc_i4_1()?
                    .stloc_0()?
                    .leave_s("done")?
                    .catch_end("outer")?
                    .catch_start("outer", corlib.divide_by_zero_exception)?
                    .pop()?
                    .ldc_i4_2()?
                    .stloc_0()?
                    .leave_s("done")?
                    .catch_end("outer")?
                    .label("done")?
                    .ldloc_0()?
                    .ret()?;
                Ok(())
            }),
    )?;

    assert_eq!(program.runtime().invoke(method, vec![])?, Value::I4(2));
    Ok(())
}

#[test]
fn rethrow_preserves_exception() -> Result<()> {
    let program = Program::new()?;
    let corlib = program.module.corlib().clone();
    let (_, invalid_operation) = program.exception_ctors(corlib.invalid_operation_exception)?;
    let first = program.module.add_user_string("first");
    let caught = program.module.add_user_string("caught");
    let method = program.method(
        "Rethrown",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.try_start("outer")?
                .try_start("inner")?
                .ldstr(first)?
                .newobj(invalid_operation)?
                .throw()?
                .try_end("inner")?
                .catch_start("inner", corlib.exception)?
                .pop()?
                .ldstr(caught)?
                .call(corlib.console_write_line_string)?
                .rethrow()?
                .catch_end("inner")?
                .try_end("outer")?
                .catch_start("outer", corlib.invalid_operation_exception)?
                .callvirt(corlib.exception_message)?
                .call(corlib.console_write_line_string)?
                .leave_s("done")?
                .catch_end("outer")?
                .label("done")?
                .ret()?;
            Ok(())
        }),
    )?;

    let runtime = program.runtime();
    runtime.invoke(method, vec![])?;
    assert_eq!(runtime.console().lines(), vec!["caught", "first"]);
    Ok(())
}

#[test]
fn value_types_by_address_and_newobj() -> Result<()> {
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

    let method = program.method(
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

    assert_eq!(program.runtime().invoke(method, vec![])?, Value::I4(12));
    Ok(())
}

#[test]
fn virtual_dispatch_uses_runtime_type() -> Result<()> {
    let program = Program::new()?;
    let module = &program.module;
    let object_ctor = module.corlib().object_ctor;
    let silence = module.add_user_string("...");
    let woof = module.add_user_string("Woof");
    let constructor = move |owner| {
        MethodDefBuilder::constructor()
            .body(MethodBodyBuilder::new().implementation(move |asm| {
                asm.ldarg_0()?.call(object_ctor)?.ret()?;
                Ok(())
            }))
            .build(module, owner)
    };

    let animal = TypeDefBuilder::new("Tests", "Animal").build(module)?;
    let speak = MethodDefBuilder::new("Speak")
        .virtual_method()
        .returns(TypeSig::String)
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldstr(silence)?.ret()?;
            Ok(())
        }))
        .build(module, animal)?;
    let dog = TypeDefBuilder::new("Tests", "Dog").base(animal).build(module)?;
    let dog_ctor = constructor(dog)?;
    MethodDefBuilder::new("Speak")
        .virtual_method()
        .returns(TypeSig::String)
        .body(MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldstr(woof)?.ret()?;
            Ok(())
        }))
        .build(module, dog)?;
    let cat = TypeDefBuilder::new("Tests", "Cat").base(animal).build(module)?;
    let cat_ctor = constructor(cat)?;

    let speak_as = |name: &str, ctor: Token| {
        program.method(
            name,
            TypeSig::String,
            MethodBodyBuilder::new().implementation(move |asm| {
                asm.newobj(ctor)?.callvirt(speak)?.ret()?;
                Ok(())
            }),
        )
    };
    let dog_speaks = speak_as("DogSpeaks", dog_ctor)?;
    let cat_speaks = speak_as("CatSpeaks", cat_ctor)?;

    let runtime = program.runtime();
    let spoken = runtime.invoke(dog_speaks, vec![])?;
    assert_eq!(runtime.string_value(&spoken)?.as_deref(), Some("Woof"));
    let spoken = runtime.invoke(cat_speaks, vec![])?;
    assert_eq!(runtime.string_value(&spoken)?.as_deref(), Some("..."));
    Ok(())
}

#[test]
fn constrained_calls_on_value_types() -> Result<()> {
    let program = Program::new()?;
    let module = &program.module;
    let named = TypeDefBuilder::new("Tests", "INamed").interface().build(module)?;
    let name = MethodDefBuilder::new("Name")
        .returns(TypeSig::I4)
        .build(module, named)?;
    let tag = TypeDefBuilder::new("Tests", "Tag")
        .value_type()
        .implements(named)
        .build(module)?;
    MethodDefBuilder::new("Name")
        .virtual_method()
        .final_method()
        .returns(TypeSig::I4)
        .body(MethodBodyBuilder::new().implementation(|asm| {
            asm.ldc_i4_s(9)?.ret()?;
            Ok(())
        }))
        .build(module, tag)?;

    let method = program.method(
        "Constrained",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::ValueType(tag))
            .implementation(move |asm| {
                asm.ldloca(0)?
                    .initobj(tag)?
                    .ldloca(0)?
                    .constrained(tag)?
                    .callvirt(name)?
                    .ret()?;
                Ok(())
            }),
    )?;

    assert_eq!(program.runtime().invoke(method, vec![])?, Value::I4(9));
    Ok(())
}

#[test]
fn delegates_invoke_their_target() -> Result<()> {
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
    let method = program.method(
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

    let runtime = program.runtime();
    runtime.invoke(method, vec![])?;
    assert_eq!(runtime.console().lines(), vec!["hello"]);
    Ok(())
}

#[test]
fn arrays() -> Result<()> {
    let program = Program::new()?;
    let int32 = program.module.corlib().int32;
    let method = program.method(
        "Elements",
        TypeSig::I4,
        MethodBodyBuilder::new()
            .local(TypeSig::SzArray(Box::new(TypeSig::I4)))
            .implementation(move |asm| {
                asm.ldc_i4_3()?.newarr(int32)?.stloc_0()?;
                for (index, value) in [10, 20, 30].into_iter().enumerate() {
                    asm.ldloc_0()?
                        .ldc_i4(index as i32)?
                        .ldc_i4(value)?
                        .stelem_i4()?;
                }
                asm.ldloc_0()?
                    .ldc_i4_0()?
                    .ldelem_i4()?
                    .ldloc_0()?
                    .ldc_i4_2()?
                    .ldelem_i4()?
                    .add()?
                    .ldloc_0()?
                    .ldlen()?
                    .conv_i4()?
                    .add()?
                    .ret()?;
                Ok(())
            }),
    )?;

    assert_eq!(program.runtime().invoke(method, vec![])?, Value::I4(43));
    Ok(())
}

#[test]
fn unhandled_index_out_of_range() -> Result<()> {
    let program = Program::new()?;
    let int32 = program.module.corlib().int32;
    let method = program.method(
        "OutOfRange",
        TypeSig::I4,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.ldc_i4_1()?
                .newarr(int32)?
                .ldc_i4_5()?
                .ldelem_i4()?
                .ret()?;
            Ok(())
        }),
    )?;

    assert!(matches!(
        program.runtime().invoke(method, vec![]),
        Err(Error::ManagedException { type_name, .. }) if type_name == "System.IndexOutOfRangeException"
    ));
    Ok(())
}

#[test]
fn instructions_without_execution_rule() -> Result<()> {
    let program = Program::new()?;
    let method = MethodDefBuilder::new("Alloc")
        .static_method()
        .build(&program.module, program.class)?;
    // tiny header, 4 code bytes: ldc.i4.0, localloc, ret
    program
        .module
        .set_body(method, vec![0x12, 0x16, 0xFE, 0x0F, 0x2A])?;

    assert!(matches!(
        program.runtime().invoke(method, vec![]),
        Err(Error::UnsupportedInstruction { offset: 1, .. })
    ));
    Ok(())
}

#[test]
fn call_depth_limit() -> Result<()> {
    let program = Program::new()?;
    let recurse = MethodDefBuilder::new("Recurse")
        .static_method()
        .build(&program.module, program.class)?;
    program.module.implement(
        recurse,
        MethodBodyBuilder::new().implementation(move |asm| {
            asm.call(recurse)?.ret()?;
            Ok(())
        }),
    )?;

    let runtime = Runtime::with_limits(
        program.module.clone(),
        RuntimeLimits::new().with_max_call_depth(8),
    );
    assert!(matches!(
        runtime.invoke(recurse, vec![]),
        Err(Error::CallDepthExceeded(8))
    ));
    Ok(())
}

#[test]
fn instruction_budget() -> Result<()> {
    let program = Program::new()?;
    let spin = program.method(
        "Spin",
        TypeSig::Void,
        MethodBodyBuilder::new().implementation(|asm| {
            asm.label("top")?.br_s("top")?;
            Ok(())
        }),
    )?;

    let runtime = Runtime::with_limits(
        program.module.clone(),
        RuntimeLimits::new().with_max_instructions(100),
    );
    assert!(matches!(
        runtime.invoke(spin, vec![]),
        Err(Error::InstructionLimit(100))
    ));
    Ok(())
}
