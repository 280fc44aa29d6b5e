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

//! Textual listings of method bodies.
//!
//! A listing has one `IL_xxxx: mnemonic operand` line per instruction, followed by one
//! line per exception clause. Member tokens are shown by name, user strings quoted,
//! and branch targets as labels. In rewritten bodies, dynamic scope tokens are shown
//! by the name of the stub or member they refer to.

use std::fmt::Write;

use crate::{
    assembly::{decode_method, DecodedMethod, Instruction, Operand},
    emulation::{DynamicMethod, DynamicScope},
    metadata::{
        method::ExceptionRegionKind,
        symbols::SymbolTable,
        token::{TableId, Token},
    },
    Result,
};

/// Renders the body of `method`.
///
/// # Errors
/// Returns [`crate::Error::MethodNotFound`] for unknown tokens and
/// [`crate::Error::UnreadableMethodBody`] for methods without a body.
pub fn decompile(symbols: &dyn SymbolTable, method: Token) -> Result<String> {
    let method = symbols.method(method)?;
    let decoded = decode_method(symbols, &method)?;
    Ok(render(symbols, &decoded, None))
}

/// Renders a rewritten body.
#[must_use]
pub fn decompile_dynamic(symbols: &dyn SymbolTable, method: &DynamicMethod) -> String {
    render(symbols, method.decoded(), Some(method.scope()))
}

fn render(symbols: &dyn SymbolTable, decoded: &DecodedMethod, scope: Option<&DynamicScope>) -> String {
    let mut out = String::new();
    for instruction in &decoded.instructions {
        let _ = write!(out, "IL_{:04X}: {}", instruction.offset, instruction.mnemonic);
        if let Some(operand) = operand_text(symbols, instruction, scope) {
            let _ = write!(out, " {operand}");
        }
        out.push('\n');
    }

    for clause in &decoded.exception_regions {
        let _ = write!(
            out,
            ".try IL_{:04X} to IL_{:04X} {}",
            clause.try_offset,
            clause.try_offset + clause.try_length,
            clause.kind()
        );
        match clause.kind() {
            ExceptionRegionKind::Catch => {
                if let Some(class) = clause.handler {
                    let _ = write!(out, " {}", token_text(symbols, class, scope));
                }
            }
            ExceptionRegionKind::Filter => {
                let _ = write!(out, " IL_{:04X}", clause.filter_offset);
            }
            ExceptionRegionKind::Finally | ExceptionRegionKind::Fault => {}
        }
        let _ = writeln!(
            out,
            " handler IL_{:04X} to IL_{:04X}",
            clause.handler_offset,
            clause.handler_offset + clause.handler_length
        );
    }
    out
}

fn operand_text(
    symbols: &dyn SymbolTable,
    instruction: &Instruction,
    scope: Option<&DynamicScope>,
) -> Option<String> {
    match &instruction.operand {
        Operand::None => None,
        Operand::Immediate(value) => {
            if instruction.branch_targets.is_empty() {
                Some(value.to_string())
            } else {
                Some(targets(&instruction.branch_targets))
            }
        }
        Operand::Target(target) => Some(format!("IL_{target:04X}")),
        Operand::Switch(_) => Some(format!("({})", targets(&instruction.branch_targets))),
        Operand::Token(token) => Some(token_text(symbols, *token, scope)),
        Operand::Local(index) => Some(format!("V_{index}")),
        Operand::Argument(index) => Some(format!("A_{index}")),
    }
}

fn targets(offsets: &[u64]) -> String {
    offsets
        .iter()
        .map(|target| format!("IL_{target:04X}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn token_text(symbols: &dyn SymbolTable, token: Token, scope: Option<&DynamicScope>) -> String {
    match token.table_id() {
        Some(TableId::MethodDef | TableId::MethodSpec) => symbols.method_name(token),
        Some(TableId::TypeDef) => symbols
            .type_def(token)
            .map(|def| def.full_name())
            .unwrap_or_else(|_| token.to_string()),
        Some(TableId::Field) => match symbols.field(token) {
            Ok(field) => {
                let owner = symbols
                    .type_def(field.declaring_type)
                    .map(|def| def.full_name())
                    .unwrap_or_else(|_| field.declaring_type.to_string());
                format!("{owner}::{}", field.name)
            }
            Err(_) => token.to_string(),
        },
        Some(TableId::UserString) => symbols
            .user_string(token)
            .map(|text| format!("{text:?}"))
            .unwrap_or_else(|_| token.to_string()),
        Some(TableId::Dynamic) => match scope {
            Some(scope) => scope.describe(token, symbols),
            None => token.to_string(),
        },
        Some(TableId::StandAloneSig) | None => token.to_string(),
    }
}
