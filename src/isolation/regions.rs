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

//! Exception region tracking.
//!
//! Method bodies describe exception handling as a flat clause table with byte
//! offsets; the encoder builds clauses from nested `begin`/`end` calls. The
//! [`RegionTracker`] converts the former into the latter: for every offset of the
//! original stream it lists the structural events the rewriter replays before
//! emitting the instruction found there.
//!
//! Clauses sharing a guarded range form one group (one `try` with several handlers).
//! A group closes at the end of its lexically last handler. At a single offset events
//! are ordered so that nesting is preserved:
//!
//! 1. groups ending here, innermost first
//! 2. the handler (or filter) starting here
//! 3. groups beginning here, outermost first

use std::collections::BTreeMap;

use crate::{
    assembly::InstructionEncoder,
    metadata::{
        method::{ExceptionHandler, ExceptionRegionKind},
        token::Token,
    },
    Result,
};

/// A structural change at one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionEvent {
    /// A guarded block opens
    BeginTry,
    /// A typed catch handler starts
    BeginCatch(Token),
    /// A filter expression starts
    BeginFilter,
    /// The handler guarded by the preceding filter starts
    BeginFilteredHandler,
    /// A finally handler starts
    BeginFinally,
    /// A fault handler starts
    BeginFault,
    /// The innermost open group ends
    EndTry,
}

/// One `try` with all the handlers attached to it.
#[derive(Debug)]
struct RegionGroup {
    try_start: u32,
    try_length: u32,
    end: u32,
}

/// Offset-ordered begin/end events of a method's exception regions.
#[derive(Debug, Default)]
pub struct RegionTracker {
    events: BTreeMap<u64, Vec<RegionEvent>>,
}

impl RegionTracker {
    /// Builds the event list for a clause table.
    #[must_use]
    pub fn new(handlers: &[ExceptionHandler]) -> Self {
        let mut groups: Vec<RegionGroup> = Vec::new();
        for handler in handlers {
            match groups.iter_mut().find(|group| {
                group.try_start == handler.try_offset && group.try_length == handler.try_length
            }) {
                Some(group) => group.end = group.end.max(handler.handler_end()),
                None => groups.push(RegionGroup {
                    try_start: handler.try_offset,
                    try_length: handler.try_length,
                    end: handler.handler_end(),
                }),
            }
        }

        // Groups are anonymous to the encoder, so only the number of opening and
        // closing groups per offset matters.
        let mut ends: BTreeMap<u64, usize> = BTreeMap::new();
        let mut begins: BTreeMap<u64, usize> = BTreeMap::new();
        for group in &groups {
            *ends.entry(u64::from(group.end)).or_default() += 1;
            *begins.entry(u64::from(group.try_start)).or_default() += 1;
        }

        let mut starts: BTreeMap<u64, Vec<RegionEvent>> = BTreeMap::new();
        for handler in handlers {
            let handler_offset = u64::from(handler.handler_offset);
            match handler.kind() {
                ExceptionRegionKind::Catch => starts.entry(handler_offset).or_default().push(
                    RegionEvent::BeginCatch(handler.handler.unwrap_or(Token::new(0))),
                ),
                ExceptionRegionKind::Filter => {
                    starts
                        .entry(u64::from(handler.filter_offset))
                        .or_default()
                        .push(RegionEvent::BeginFilter);
                    starts
                        .entry(handler_offset)
                        .or_default()
                        .push(RegionEvent::BeginFilteredHandler);
                }
                ExceptionRegionKind::Finally => starts
                    .entry(handler_offset)
                    .or_default()
                    .push(RegionEvent::BeginFinally),
                ExceptionRegionKind::Fault => starts
                    .entry(handler_offset)
                    .or_default()
                    .push(RegionEvent::BeginFault),
            }
        }

        let mut events: BTreeMap<u64, Vec<RegionEvent>> = BTreeMap::new();
        for (offset, closing) in ends {
            events
                .entry(offset)
                .or_default()
                .extend(std::iter::repeat(RegionEvent::EndTry).take(closing));
        }
        for (offset, handler_starts) in starts {
            events.entry(offset).or_default().extend(handler_starts);
        }
        for (offset, opening) in begins {
            events
                .entry(offset)
                .or_default()
                .extend(std::iter::repeat(RegionEvent::BeginTry).take(opening));
        }

        RegionTracker { events }
    }

    /// Events at `offset`, in replay order.
    #[must_use]
    pub fn events_at(&self, offset: u64) -> &[RegionEvent] {
        self.events.get(&offset).map_or(&[], Vec::as_slice)
    }

    /// Every offset with at least one event, ascending.
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.events.keys().copied()
    }

    /// Whether the method has no exception regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Replays the events at `offset` on an encoder.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the encoder rejects the block structure.
    pub fn apply(&self, offset: u64, encoder: &mut InstructionEncoder) -> Result<()> {
        for event in self.events_at(offset) {
            match event {
                RegionEvent::BeginTry => encoder.begin_exception_block(),
                RegionEvent::BeginCatch(class) => encoder.begin_catch_block(*class)?,
                RegionEvent::BeginFilter => encoder.begin_filter_block()?,
                RegionEvent::BeginFilteredHandler => encoder.begin_filtered_handler()?,
                RegionEvent::BeginFinally => encoder.begin_finally_block()?,
                RegionEvent::BeginFault => encoder.begin_fault_block()?,
                RegionEvent::EndTry => encoder.end_exception_block()?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::ExceptionHandlerFlags;

    fn clause(
        flags: ExceptionHandlerFlags,
        try_range: (u32, u32),
        handler_range: (u32, u32),
    ) -> ExceptionHandler {
        ExceptionHandler {
            flags,
            try_offset: try_range.0,
            try_length: try_range.1 - try_range.0,
            handler_offset: handler_range.0,
            handler_length: handler_range.1 - handler_range.0,
            handler: None,
            filter_offset: 0,
        }
    }

    #[test]
    fn catches_sharing_a_guarded_range_form_one_group() {
        let first = Token::new(0x0200_0010);
        let second = Token::new(0x0200_0011);
        let mut catch_first = clause(ExceptionHandlerFlags::EXCEPTION, (0, 10), (10, 20));
        catch_first.handler = Some(first);
        let mut catch_second = clause(ExceptionHandlerFlags::EXCEPTION, (0, 10), (20, 30));
        catch_second.handler = Some(second);

        let tracker = RegionTracker::new(&[catch_first, catch_second]);
        assert_eq!(tracker.events_at(0), &[RegionEvent::BeginTry]);
        assert_eq!(tracker.events_at(10), &[RegionEvent::BeginCatch(first)]);
        assert_eq!(tracker.events_at(20), &[RegionEvent::BeginCatch(second)]);
        assert_eq!(tracker.events_at(30), &[RegionEvent::EndTry]);
        assert_eq!(tracker.offsets().collect::<Vec<_>>(), vec![0, 10, 20, 30]);
    }

    #[test]
    fn try_catch_inside_try_finally() {
        let inner = clause(ExceptionHandlerFlags::EXCEPTION, (0, 10), (10, 20));
        let outer = clause(ExceptionHandlerFlags::FINALLY, (0, 20), (20, 26));

        let tracker = RegionTracker::new(&[inner, outer]);
        assert_eq!(
            tracker.events_at(0),
            &[RegionEvent::BeginTry, RegionEvent::BeginTry]
        );
        assert_eq!(
            tracker.events_at(20),
            &[RegionEvent::EndTry, RegionEvent::BeginFinally]
        );
        assert_eq!(tracker.events_at(26), &[RegionEvent::EndTry]);
    }

    #[test]
    fn region_starting_where_another_ends() {
        let first = clause(ExceptionHandlerFlags::FAULT, (0, 4), (4, 8));
        let second = clause(ExceptionHandlerFlags::FINALLY, (8, 12), (12, 16));

        let tracker = RegionTracker::new(&[second, first]);
        assert_eq!(
            tracker.events_at(8),
            &[RegionEvent::EndTry, RegionEvent::BeginTry]
        );
        assert_eq!(tracker.events_at(4), &[RegionEvent::BeginFault]);
    }

    #[test]
    fn filters_have_two_entry_points() {
        let mut filter = clause(ExceptionHandlerFlags::FILTER, (0, 6), (12, 18));
        filter.filter_offset = 6;

        let tracker = RegionTracker::new(&[filter]);
        assert_eq!(tracker.events_at(6), &[RegionEvent::BeginFilter]);
        assert_eq!(tracker.events_at(12), &[RegionEvent::BeginFilteredHandler]);
        assert_eq!(tracker.events_at(18), &[RegionEvent::EndTry]);
        assert!(tracker.events_at(3).is_empty());
    }

    #[test]
    fn replay_reproduces_clauses() -> Result<()> {
        let mut inner = clause(ExceptionHandlerFlags::EXCEPTION, (0, 2), (2, 4));
        inner.handler = Some(Token::new(0x0200_0010));
        let outer = clause(ExceptionHandlerFlags::FINALLY, (0, 4), (4, 6));
        let tracker = RegionTracker::new(&[inner, outer]);

        // 0: nop; leave.s 6 | 2: pop; leave.s 6 | 4: nop; endfinally | 6: ret
        let mut encoder = InstructionEncoder::new();
        tracker.apply(0, &mut encoder)?;
        encoder.emit_instruction("nop", None)?;
        encoder.emit_branch("leave.s", "end")?;
        tracker.apply(2, &mut encoder)?;
        encoder.emit_instruction("pop", None)?;
        encoder.emit_branch("leave.s", "end")?;
        tracker.apply(4, &mut encoder)?;
        encoder.emit_instruction("nop", None)?;
        encoder.emit_instruction("endfinally", None)?;
        tracker.apply(6, &mut encoder)?;
        encoder.define_label("end")?;
        encoder.emit_instruction("ret", None)?;

        let (code, _, _, mut handlers) = encoder.finalize()?;
        assert_eq!(code.len(), 9);
        handlers.sort_by_key(|handler| handler.try_length);

        assert_eq!(handlers[0].kind(), ExceptionRegionKind::Catch);
        assert_eq!((handlers[0].try_offset, handlers[0].try_length), (0, 3));
        assert_eq!((handlers[0].handler_offset, handlers[0].handler_length), (3, 3));
        assert_eq!(handlers[1].kind(), ExceptionRegionKind::Finally);
        assert_eq!((handlers[1].try_offset, handlers[1].try_length), (0, 6));
        assert_eq!((handlers[1].handler_offset, handlers[1].handler_length), (6, 2));
        Ok(())
    }
}
