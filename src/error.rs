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

use thiserror::Error;

use crate::{emulation::HeapRef, metadata::token::Token};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

macro_rules! unsupported_instruction {
    ($offset:expr, $($arg:tt)*) => {
        crate::Error::UnsupportedInstruction {
            offset: $offset,
            reason: format!($($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Interception Errors
/// - [`Error::UnreadableMethodBody`] - The target has no CIL body to decode
/// - [`Error::UnsupportedInstruction`] - The rewriter has no emission rule for an instruction
/// - [`Error::InvalidShimSignature`] - A replacement does not match the method it replaces
///
/// ## Parsing and Encoding Errors
/// - [`Error::Malformed`] - Corrupted or invalid method body
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a byte stream
/// - [`Error::InvalidMnemonic`], [`Error::InvalidBranch`], [`Error::UndefinedLabel`],
///   [`Error::DuplicateLabel`], [`Error::UnexpectedOperand`], [`Error::WrongOperandType`] -
///   Encoder misuse
///
/// ## Execution Errors
/// - [`Error::ManagedException`] - A managed exception escaped the entry method
/// - [`Error::StackUnderflow`], [`Error::TypeMismatch`] - Invalid evaluation stack state
/// - [`Error::CallDepthExceeded`], [`Error::InstructionLimit`] - Configured limits reached
///
/// # Examples
///
/// ```rust
/// use dotshim::{emulation::{NativeMethod, Value}, isolation::Shim, metadata::{Module, TypeSig}, Error};
///
/// let module = Module::new();
/// let write_line = module.corlib().console_write_line_string;
/// let wrong = NativeMethod::new("wrong", vec![], TypeSig::Void, |_, _| Ok(Value::Void));
/// match Shim::replace(&module, write_line).and_then(|shim| shim.with_native(&module, wrong)) {
///     Err(Error::InvalidShimSignature(message)) => {
///         assert_eq!(message, "Parameters count do not match")
///     }
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The method has no CIL body that could be decoded.
    ///
    /// Abstract methods, runtime-implemented methods, internal calls and interface
    /// declarations have no instructions. Interception recovers from this by forwarding
    /// the original call unchanged.
    #[error("Method {0} has no readable body")]
    UnreadableMethodBody(Token),

    /// An instruction was encountered that the rewriter or interpreter cannot handle.
    ///
    /// This is never approximated: the whole rewrite (and the isolation run that
    /// triggered it) is abandoned.
    #[error("Unsupported instruction at IL_{offset:04X}: {reason}")]
    UnsupportedInstruction {
        /// Offset of the instruction within its method body
        offset: u64,
        /// What made the instruction unsupported
        reason: String,
    },

    /// A shim replacement does not structurally match the method it replaces.
    #[error("Invalid shim signature: {0}")]
    InvalidShimSignature(String),

    /// The body is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing a byte stream.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The requested operation is not supported.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// Failed to find a type in the symbol table.
    #[error("Failed to find type - {0}")]
    TypeNotFound(Token),

    /// Failed to find a method in the symbol table.
    #[error("Failed to find method - {0}")]
    MethodNotFound(String),

    /// Failed to find a field in the symbol table.
    #[error("Failed to find field - {0}")]
    FieldNotFound(Token),

    /// Failed to resolve a user string token.
    #[error("Failed to find user string - {0}")]
    StringNotFound(Token),

    /// The mnemonic passed to the encoder does not exist.
    #[error("Invalid mnemonic - {0}")]
    InvalidMnemonic(String),

    /// A branch was emitted with an instruction that cannot branch.
    #[error("Invalid branch - {0}")]
    InvalidBranch(String),

    /// A branch references a label that was never defined.
    #[error("Undefined label - {0}")]
    UndefinedLabel(String),

    /// A label was defined twice.
    #[error("Duplicate label - {0}")]
    DuplicateLabel(String),

    /// An operand was supplied to an instruction that takes none.
    #[error("Unexpected operand")]
    UnexpectedOperand,

    /// The operand does not match the instruction's operand type.
    #[error("Wrong operand type - expected {expected}")]
    WrongOperandType {
        /// The operand type the instruction requires
        expected: String,
    },

    /// The evaluation stack did not hold enough values.
    #[error("Evaluation stack underflow at IL_{0:04X}")]
    StackUnderflow(u64),

    /// A value had a different shape than the instruction required.
    #[error("Type mismatch - {0}")]
    TypeMismatch(String),

    /// A managed exception escaped the entry method of an isolation run.
    #[error("Unhandled managed exception {type_name}: {message}")]
    ManagedException {
        /// Full name of the exception type
        type_name: String,
        /// The exception message, empty if none was provided
        message: String,
    },

    /// An exception object in flight between frames.
    ///
    /// Never escapes the crate; the runtime converts it into [`Error::ManagedException`]
    /// once no frame handles it.
    #[error("Managed exception in flight - {0}")]
    Thrown(HeapRef),

    /// The configured maximum call depth was exceeded.
    #[error("Reached the maximum call depth allowed - {0}")]
    CallDepthExceeded(usize),

    /// The configured instruction budget was exhausted.
    #[error("Reached the maximum number of executed instructions - {0}")]
    InstructionLimit(u64),

    /// Failed to lock target
    #[error("Failed to lock target")]
    LockError,
}
