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

//! Method body headers, code and exception sections.
//!
//! Supports both tiny and fat method headers as specified by ECMA-335 II.25.4, and
//! the small and fat exception clause layouts that may follow the code. The same
//! format is used for bodies stored in a [`crate::metadata::Module`] and for bodies
//! produced by the method rewriter, so [`encode_method_body`] is the exact inverse
//! of [`MethodBody::from`].
//!
//! # Examples
//!
//! ```rust
//! use dotshim::metadata::method::MethodBody;
//!
//! // tiny header for a 1-byte body: `ret`
//! let data = [0x06, 0x2A];
//! let body = MethodBody::from(&data)?;
//! assert!(!body.is_fat);
//! assert_eq!(body.size_code, 1);
//! assert_eq!(body.code(&data)?, &[0x2A]);
//! # Ok::<(), dotshim::Error>(())
//! ```

use crate::{
    file::io::{push_le, read_le, read_le_at},
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBodyFlags, SectionFlags},
        token::Token,
    },
    Error::OutOfBounds,
    Result,
};

/// Largest code size a tiny header can describe
const TINY_MAX_CODE: usize = 0x3F;
/// Largest evaluation stack a tiny header implies
const TINY_MAX_STACK: u16 = 8;
/// Size of a small exception clause
const SMALL_CLAUSE_SIZE: usize = 12;
/// Size of a fat exception clause
const FAT_CLAUSE_SIZE: usize = 24;

/// A parsed method body header, with its exception clauses.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Size of the CIL code in bytes
    pub size_code: usize,
    /// Size of the header in bytes
    pub size_header: usize,
    /// `StandAloneSig` token describing the locals, 0 if there are none
    pub local_var_sig_token: u32,
    /// Maximum evaluation stack depth
    pub max_stack: usize,
    /// Whether the header is in fat format
    pub is_fat: bool,
    /// Whether locals are zero-initialized
    pub is_init_local: bool,
    /// Whether exception sections were present
    pub is_exception_data: bool,
    /// Exception handling clauses in table order
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Parses a method body from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an unknown header format and
    /// [`crate::Error::OutOfBounds`] when the data is truncated.
    pub fn from(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    local_var_sig_token: 0,
                    max_stack: TINY_MAX_STACK as usize,
                    is_fat: false,
                    is_init_local: false,
                    is_exception_data: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;

                let size_header = ((first_duo >> 12) * 4) as usize;
                let size_code = read_le::<u32>(&data[4..])? as usize;
                if size_header < 12 {
                    return Err(malformed_error!("Fat header too small - {}", size_header));
                }
                if data.len() < size_code.saturating_add(size_header) {
                    return Err(OutOfBounds);
                }

                let local_var_sig_token = read_le::<u32>(&data[8..])?;
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000_1111_1111_1111_u16);
                let max_stack = read_le::<u16>(&data[2..])? as usize;
                let is_init_local = flags_header.contains(MethodBodyFlags::INIT_LOCALS);

                let mut exception_handlers = Vec::new();
                if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    let mut cursor = (size_header + size_code + 3) & !3;
                    parse_sections(data, &mut cursor, &mut exception_handlers)?;
                }

                Ok(MethodBody {
                    size_code,
                    size_header,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local,
                    is_exception_data: !exception_handlers.is_empty(),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Size of header plus code.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_code + self.size_header
    }

    /// The CIL code slice of the body this header was parsed from.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the header claims.
    pub fn code<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.size_header..self.size())
            .ok_or(OutOfBounds)
    }

    /// The locals signature token, if the body declares locals.
    #[must_use]
    pub fn local_signature(&self) -> Option<Token> {
        if self.local_var_sig_token == 0 {
            None
        } else {
            Some(Token::new(self.local_var_sig_token))
        }
    }
}

fn parse_sections(
    data: &[u8],
    cursor: &mut usize,
    exception_handlers: &mut Vec<ExceptionHandler>,
) -> Result<()> {
    while data.len() > (*cursor + 4) {
        let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(&data[*cursor..])?);
        if !section_flags.contains(SectionFlags::EHTABLE) {
            break;
        }

        let is_fat = section_flags.contains(SectionFlags::FAT_FORMAT);
        let section_size = if is_fat {
            (read_le::<u32>(&data[*cursor + 1..])? & 0x00FF_FFFF) as usize
        } else {
            read_le::<u8>(&data[*cursor + 1..])? as usize
        };
        if section_size < 4 || data.len() < (*cursor + section_size) {
            return Err(OutOfBounds);
        }

        *cursor += 4;
        let clause_size = if is_fat { FAT_CLAUSE_SIZE } else { SMALL_CLAUSE_SIZE };
        for _ in 0..(section_size - 4) / clause_size {
            let (flags, try_offset, try_length, handler_offset, handler_length) = if is_fat {
                // Clause flags are stored as u32 but only the low bits are defined
                #[allow(clippy::cast_possible_truncation)]
                let flags = read_le_at::<u32>(data, cursor)? as u16;
                (
                    flags,
                    read_le_at::<u32>(data, cursor)?,
                    read_le_at::<u32>(data, cursor)?,
                    read_le_at::<u32>(data, cursor)?,
                    read_le_at::<u32>(data, cursor)?,
                )
            } else {
                (
                    read_le_at::<u16>(data, cursor)?,
                    u32::from(read_le_at::<u16>(data, cursor)?),
                    u32::from(read_le_at::<u8>(data, cursor)?),
                    u32::from(read_le_at::<u16>(data, cursor)?),
                    u32::from(read_le_at::<u8>(data, cursor)?),
                )
            };
            let class_or_filter = read_le_at::<u32>(data, cursor)?;

            let flags = ExceptionHandlerFlags::from_bits_truncate(flags);
            let is_catch = !flags.intersects(
                ExceptionHandlerFlags::FILTER
                    | ExceptionHandlerFlags::FINALLY
                    | ExceptionHandlerFlags::FAULT,
            );
            exception_handlers.push(ExceptionHandler {
                flags,
                try_offset,
                try_length,
                handler_offset,
                handler_length,
                handler: is_catch.then(|| Token::new(class_or_filter)),
                filter_offset: if is_catch { 0 } else { class_or_filter },
            });
        }

        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            break;
        }
    }

    Ok(())
}

/// Encodes a complete method body: header, code and exception section.
///
/// A tiny header is used whenever the body allows it (short code, small stack, no
/// locals, no clauses); otherwise a fat header is written. Clauses are written in the
/// small layout if every clause fits and in the fat layout otherwise.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the code or clause table exceeds the
/// encodable sizes.
pub fn encode_method_body(
    code: &[u8],
    max_stack: u16,
    local_var_sig_token: u32,
    init_locals: bool,
    handlers: &[ExceptionHandler],
) -> Result<Vec<u8>> {
    if code.len() <= TINY_MAX_CODE
        && max_stack <= TINY_MAX_STACK
        && local_var_sig_token == 0
        && handlers.is_empty()
    {
        let mut body = Vec::with_capacity(code.len() + 1);
        // code.len() <= 0x3F, fits in 6 bits
        #[allow(clippy::cast_possible_truncation)]
        body.push(((code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        body.extend_from_slice(code);
        return Ok(body);
    }

    let code_size =
        u32::try_from(code.len()).map_err(|_| malformed_error!("Method body size exceeds u32 range"))?;

    let mut flags = MethodBodyFlags::FAT_FORMAT;
    if init_locals {
        flags |= MethodBodyFlags::INIT_LOCALS;
    }
    if !handlers.is_empty() {
        flags |= MethodBodyFlags::MORE_SECTS;
    }

    let mut body = Vec::with_capacity(12 + code.len());
    push_le(&mut body, flags.bits() | (3 << 12));
    push_le(&mut body, max_stack);
    push_le(&mut body, code_size);
    push_le(&mut body, local_var_sig_token);
    body.extend_from_slice(code);

    if handlers.is_empty() {
        return Ok(body);
    }

    while body.len() % 4 != 0 {
        body.push(0);
    }
    encode_exception_section(&mut body, handlers)?;
    Ok(body)
}

fn encode_exception_section(body: &mut Vec<u8>, handlers: &[ExceptionHandler]) -> Result<()> {
    let small_size = handlers.len() * SMALL_CLAUSE_SIZE + 4;
    let fits_small = small_size <= 0xFF
        && handlers.iter().all(|clause| {
            clause.try_offset <= 0xFFFF
                && clause.try_length <= 0xFF
                && clause.handler_offset <= 0xFFFF
                && clause.handler_length <= 0xFF
        });

    if fits_small {
        body.push(SectionFlags::EHTABLE.bits());
        // bounded by the check above
        #[allow(clippy::cast_possible_truncation)]
        body.push(small_size as u8);
        push_le(body, 0_u16);
        for clause in handlers {
            #[allow(clippy::cast_possible_truncation)]
            {
                push_le(body, clause.flags.bits());
                push_le(body, clause.try_offset as u16);
                push_le(body, clause.try_length as u8);
                push_le(body, clause.handler_offset as u16);
                push_le(body, clause.handler_length as u8);
            }
            push_le(body, clause_class_or_filter(clause));
        }
    } else {
        let fat_size = handlers.len() * FAT_CLAUSE_SIZE + 4;
        if fat_size > 0x00FF_FFFF {
            return Err(malformed_error!("Too many exception clauses - {}", handlers.len()));
        }
        // fat_size <= 0xFFFFFF
        #[allow(clippy::cast_possible_truncation)]
        let header = u32::from(SectionFlags::EHTABLE.bits() | SectionFlags::FAT_FORMAT.bits())
            | ((fat_size as u32) << 8);
        push_le(body, header);
        for clause in handlers {
            push_le(body, u32::from(clause.flags.bits()));
            push_le(body, clause.try_offset);
            push_le(body, clause.try_length);
            push_le(body, clause.handler_offset);
            push_le(body, clause.handler_length);
            push_le(body, clause_class_or_filter(clause));
        }
    }

    Ok(())
}

fn clause_class_or_filter(clause: &ExceptionHandler) -> u32 {
    match clause.handler {
        Some(token) => token.value(),
        None => clause.filter_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catch_clause(try_offset: u32, handler_offset: u32) -> ExceptionHandler {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset,
            try_length: 4,
            handler_offset,
            handler_length: 3,
            handler: Some(Token::new(0x0200_0005)),
            filter_offset: 0,
        }
    }

    #[test]
    fn tiny() {
        let data = [0x0A, 0x00, 0x2A, 0xFF];
        let body = MethodBody::from(&data).unwrap();

        assert!(!body.is_fat);
        assert!(!body.is_exception_data);
        assert_eq!(body.size_code, 2);
        assert_eq!(body.size_header, 1);
        assert_eq!(body.size(), 3);
        assert_eq!(body.code(&data).unwrap(), &[0x00, 0x2A]);
        assert_eq!(body.local_signature(), None);
    }

    #[test]
    fn tiny_truncated() {
        assert!(matches!(MethodBody::from(&[0x0A, 0x00]), Err(OutOfBounds)));
    }

    #[test]
    fn invalid_format() {
        assert!(matches!(
            MethodBody::from(&[0x01, 0x00]),
            Err(crate::Error::Malformed { .. })
        ));
        assert!(MethodBody::from(&[]).is_err());
    }

    #[test]
    fn fat_with_locals() {
        let code = vec![0x00; 70];
        let data = encode_method_body(&code, 3, 0x1100_0002, true, &[]).unwrap();
        let body = MethodBody::from(&data).unwrap();

        assert!(body.is_fat);
        assert!(body.is_init_local);
        assert_eq!(body.max_stack, 3);
        assert_eq!(body.size_header, 12);
        assert_eq!(body.size_code, 70);
        assert_eq!(body.local_signature(), Some(Token::new(0x1100_0002)));
    }

    #[test]
    fn small_exception_section() {
        let code = [0x00; 16];
        let mut finally = catch_clause(0, 8);
        finally.flags = ExceptionHandlerFlags::FINALLY;
        finally.handler = None;
        let handlers = vec![catch_clause(0, 4), finally];

        let data = encode_method_body(&code, 2, 0, false, &handlers).unwrap();
        let body = MethodBody::from(&data).unwrap();

        assert!(body.is_exception_data);
        assert_eq!(body.exception_handlers, handlers);
    }

    #[test]
    fn fat_exception_section() {
        let code = vec![0x00; 0x1_0010];
        let handlers = vec![catch_clause(0x1_0000, 0x1_0008)];

        let data = encode_method_body(&code, 2, 0, false, &handlers).unwrap();
        // fat section flag is set on the first section byte after alignment
        let section = (12 + code.len() + 3) & !3;
        assert_eq!(data[section] & SectionFlags::FAT_FORMAT.bits(), SectionFlags::FAT_FORMAT.bits());

        let body = MethodBody::from(&data).unwrap();
        assert_eq!(body.exception_handlers, handlers);
    }

    #[test]
    fn filter_offset_preserved() {
        let code = [0x00; 24];
        let filter = ExceptionHandler {
            flags: ExceptionHandlerFlags::FILTER,
            try_offset: 0,
            try_length: 6,
            handler_offset: 12,
            handler_length: 6,
            handler: None,
            filter_offset: 6,
        };
        let data = encode_method_body(&code, 2, 0, false, &[filter.clone()]).unwrap();
        let body = MethodBody::from(&data).unwrap();
        assert_eq!(body.exception_handlers, vec![filter]);
    }
}
