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

//! The minimal core library every [`crate::metadata::Module`] starts with.
//!
//! All methods defined here are internal calls without CIL bodies; the runtime backs
//! them with native implementations (see `crate::emulation::natives`). Their tokens are
//! stable because the core library is always installed first, in a fixed order.

use crate::metadata::{
    method::{MethodImplCodeType, MethodImplOptions, MethodModifiers},
    module::ModuleTables,
    symbols::CoreTypes,
    token::Token,
    typesystem::{FieldAttributes, TypeAttributes, TypeSig},
};

/// Namespace of all core library types
pub const SYSTEM_NAMESPACE: &str = "System";

/// Tokens of the core library members.
#[derive(Debug, Clone)]
pub struct CoreLibrary {
    /// `System.Object`
    pub object: Token,
    /// `Object::.ctor()`
    pub object_ctor: Token,
    /// `Object::ToString()`
    pub object_to_string: Token,
    /// `System.ValueType`
    pub value_type: Token,
    /// `System.Int32`
    pub int32: Token,
    /// `System.Int64`
    pub int64: Token,
    /// `System.Double`
    pub double: Token,
    /// `System.Boolean`
    pub boolean: Token,
    /// `System.Char`
    pub char: Token,
    /// `System.String`
    pub string: Token,
    /// `String::Concat(string, string)`
    pub string_concat: Token,
    /// `String::ToUpper()`
    pub string_to_upper: Token,
    /// `String::get_Length()`
    pub string_length: Token,
    /// `String::op_Equality(string, string)`
    pub string_equality: Token,
    /// `System.Console`
    pub console: Token,
    /// `Console::WriteLine(string)`
    pub console_write_line_string: Token,
    /// `Console::WriteLine(int32)`
    pub console_write_line_int: Token,
    /// `System.Exception`
    pub exception: Token,
    /// `Exception::.ctor()`
    pub exception_ctor: Token,
    /// `Exception::.ctor(string)`
    pub exception_ctor_message: Token,
    /// `Exception::get_Message()`
    pub exception_message: Token,
    /// `Exception::_message`
    pub exception_message_field: Token,
    /// `System.NullReferenceException`
    pub null_reference_exception: Token,
    /// `System.InvalidCastException`
    pub invalid_cast_exception: Token,
    /// `System.DivideByZeroException`
    pub divide_by_zero_exception: Token,
    /// `System.OverflowException`
    pub overflow_exception: Token,
    /// `System.IndexOutOfRangeException`
    pub index_out_of_range_exception: Token,
    /// `System.InvalidOperationException`
    pub invalid_operation_exception: Token,
    /// `System.Action`
    pub action: Token,
    /// `Action::.ctor(object, native int)`
    pub action_ctor: Token,
    /// `Action::Invoke()`
    pub action_invoke: Token,
    /// Constructors of the exception types, `(type, .ctor(), .ctor(string))`
    pub exception_ctors: Vec<(Token, Token, Token)>,
}

impl CoreLibrary {
    pub(crate) fn install(tables: &ModuleTables) -> CoreLibrary {
        let object = tables.push_type(SYSTEM_NAMESPACE, "Object", TypeAttributes::PUBLIC, None, false);
        let value_type = tables.push_type(
            SYSTEM_NAMESPACE,
            "ValueType",
            TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT,
            Some(object),
            false,
        );
        let primitive = |name: &str| {
            tables.push_type(
                SYSTEM_NAMESPACE,
                name,
                TypeAttributes::PUBLIC | TypeAttributes::SEALED,
                Some(value_type),
                true,
            )
        };
        let int32 = primitive("Int32");
        let int64 = primitive("Int64");
        let double = primitive("Double");
        let boolean = primitive("Boolean");
        let char = primitive("Char");

        let sealed = TypeAttributes::PUBLIC | TypeAttributes::SEALED;
        let string = tables.push_type(SYSTEM_NAMESPACE, "String", sealed, Some(object), false);
        let console = tables.push_type(
            SYSTEM_NAMESPACE,
            "Console",
            sealed | TypeAttributes::ABSTRACT,
            Some(object),
            false,
        );
        let exception =
            tables.push_type(SYSTEM_NAMESPACE, "Exception", TypeAttributes::PUBLIC, Some(object), false);
        let action = tables.push_type(SYSTEM_NAMESPACE, "Action", sealed, Some(object), false);

        let instance = MethodModifiers::HIDE_BY_SIG;
        let ctor = MethodModifiers::HIDE_BY_SIG
            | MethodModifiers::SPECIAL_NAME
            | MethodModifiers::RTSPECIAL_NAME;
        let static_method = MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG;
        let virtual_method = MethodModifiers::VIRTUAL | MethodModifiers::HIDE_BY_SIG;
        let internal = |owner, name: &str, flags, params: Vec<TypeSig>, ret| {
            tables.push_method(
                owner,
                name,
                flags,
                MethodImplCodeType::IL,
                MethodImplOptions::INTERNAL_CALL,
                params,
                ret,
            )
        };

        let object_ctor = internal(object, ".ctor", ctor, vec![], TypeSig::Void);
        let object_to_string = internal(object, "ToString", virtual_method, vec![], TypeSig::String);

        let string_concat = internal(
            string,
            "Concat",
            static_method,
            vec![TypeSig::String, TypeSig::String],
            TypeSig::String,
        );
        let string_to_upper = internal(string, "ToUpper", instance, vec![], TypeSig::String);
        let string_length = internal(
            string,
            "get_Length",
            instance | MethodModifiers::SPECIAL_NAME,
            vec![],
            TypeSig::I4,
        );
        let string_equality = internal(
            string,
            "op_Equality",
            static_method | MethodModifiers::SPECIAL_NAME,
            vec![TypeSig::String, TypeSig::String],
            TypeSig::Boolean,
        );

        let console_write_line_string = internal(
            console,
            "WriteLine",
            static_method,
            vec![TypeSig::String],
            TypeSig::Void,
        );
        let console_write_line_int =
            internal(console, "WriteLine", static_method, vec![TypeSig::I4], TypeSig::Void);

        let exception_message_field = tables.push_field(
            exception,
            "_message",
            TypeSig::String,
            FieldAttributes::empty(),
        );
        let exception_ctor = internal(exception, ".ctor", ctor, vec![], TypeSig::Void);
        let exception_ctor_message =
            internal(exception, ".ctor", ctor, vec![TypeSig::String], TypeSig::Void);
        let exception_message = internal(
            exception,
            "get_Message",
            virtual_method | MethodModifiers::SPECIAL_NAME,
            vec![],
            TypeSig::String,
        );

        let mut exception_ctors = vec![(exception, exception_ctor, exception_ctor_message)];
        let mut derived_exception = |name: &str| {
            let token =
                tables.push_type(SYSTEM_NAMESPACE, name, TypeAttributes::PUBLIC, Some(exception), false);
            let default_ctor = internal(token, ".ctor", ctor, vec![], TypeSig::Void);
            let message_ctor = internal(token, ".ctor", ctor, vec![TypeSig::String], TypeSig::Void);
            exception_ctors.push((token, default_ctor, message_ctor));
            token
        };
        let null_reference_exception = derived_exception("NullReferenceException");
        let invalid_cast_exception = derived_exception("InvalidCastException");
        let divide_by_zero_exception = derived_exception("DivideByZeroException");
        let overflow_exception = derived_exception("OverflowException");
        let index_out_of_range_exception = derived_exception("IndexOutOfRangeException");
        let invalid_operation_exception = derived_exception("InvalidOperationException");

        let runtime = |owner, name: &str, flags, params: Vec<TypeSig>, ret| {
            tables.push_method(
                owner,
                name,
                flags,
                MethodImplCodeType::RUNTIME,
                MethodImplOptions::empty(),
                params,
                ret,
            )
        };
        let action_ctor = runtime(
            action,
            ".ctor",
            ctor,
            vec![TypeSig::Object, TypeSig::IntPtr],
            TypeSig::Void,
        );
        let action_invoke = runtime(action, "Invoke", virtual_method, vec![], TypeSig::Void);

        CoreLibrary {
            object,
            object_ctor,
            object_to_string,
            value_type,
            int32,
            int64,
            double,
            boolean,
            char,
            string,
            string_concat,
            string_to_upper,
            string_length,
            string_equality,
            console,
            console_write_line_string,
            console_write_line_int,
            exception,
            exception_ctor,
            exception_ctor_message,
            exception_message,
            exception_message_field,
            null_reference_exception,
            invalid_cast_exception,
            divide_by_zero_exception,
            overflow_exception,
            index_out_of_range_exception,
            invalid_operation_exception,
            action,
            action_ctor,
            action_invoke,
            exception_ctors,
        }
    }

    /// The `(.ctor(), .ctor(string))` pair of a core exception type.
    #[must_use]
    pub fn exception_constructors(&self, exception: Token) -> Option<(Token, Token)> {
        self.exception_ctors
            .iter()
            .find(|(type_token, _, _)| *type_token == exception)
            .map(|(_, default_ctor, message_ctor)| (*default_ctor, *message_ctor))
    }

    /// The well-known core types.
    #[must_use]
    pub fn core_types(&self) -> CoreTypes {
        CoreTypes {
            object: self.object,
            value_type: self.value_type,
            string: self.string,
            int32: self.int32,
            int64: self.int64,
            double: self.double,
            boolean: self.boolean,
            char: self.char,
        }
    }
}
