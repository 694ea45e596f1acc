//! Splits a raw model reply into typed units
//!
//! A reply is scanned line by line:
//!
//! ```text
//! Let me check.                 → message
//! ```python                     ┐
//! print(2+2)                    ├ code (format: python)
//! ```                           ┘
//! Done.                         → message
//! ```                           ┐
//! no language tag               ├ message (untagged fences are never run)
//! ```                           ┘
//! ```
//!
//! A fence that is never closed is not a block: its opening line and body
//! fall back to ordinary message lines.

use super::{Lmc, Role, UnitType};

const FENCE: &str = "```";

/// Parse one raw reply into assistant units, preserving their order.
///
/// Units whose content is empty after trimming are dropped.
pub fn parse_response(raw: &str) -> Vec<Lmc> {
    let mut units = Vec::new();
    let mut lines = raw.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();

        // a longer opening run (````python) is closed only by a run as long
        let ticks = trimmed.len() - trimmed.trim_start_matches('`').len();
        if ticks < FENCE.len() {
            push_message(&mut units, trimmed);
            continue;
        }
        let (fence, rest) = trimmed.split_at(ticks);

        // ```python print(1)``` on one line is prose, not a block
        if rest.contains(FENCE) {
            push_message(&mut units, trimmed);
            continue;
        }

        let tag = rest.split_whitespace().next().unwrap_or("");
        let mut body: Vec<&str> = Vec::new();
        let mut closed = false;

        for inner in lines.by_ref() {
            if let Some(before) = inner.trim_end().strip_suffix(fence) {
                body.push(before);
                closed = true;
                break;
            }
            body.push(inner);
        }

        if !closed {
            push_message(&mut units, trimmed);
            for inner in body {
                push_message(&mut units, inner.trim());
            }
            continue;
        }

        let source = body.join("\n");
        let source = source.trim();
        if source.is_empty() {
            continue;
        }

        if tag.is_empty() {
            units.push(Lmc::message(Role::Assistant, source));
        } else if let Ok(unit) = Lmc::code(Role::Assistant, tag, source) {
            units.push(unit);
        }
    }

    units
}

fn push_message(units: &mut Vec<Lmc>, text: &str) {
    if !text.is_empty() {
        units.push(Lmc::message(Role::Assistant, text));
    }
}

/// Select the unit that decides what the agent does next.
///
/// Leading message lines belong to one answer, so they are joined into a
/// single message. Returns the primary unit and how many parsed units were
/// left over and will be ignored.
pub fn primary_unit(units: Vec<Lmc>) -> Option<(Lmc, usize)> {
    let first = units.first()?;

    if first.unit_type() != UnitType::Message {
        let ignored = units.len() - 1;
        return units.into_iter().next().map(|unit| (unit, ignored));
    }

    let leading = units
        .iter()
        .take_while(|unit| unit.unit_type() == UnitType::Message)
        .count();
    let text = units[..leading]
        .iter()
        .map(|unit| unit.content())
        .collect::<Vec<_>>()
        .join("\n");

    Some((Lmc::message(first.role(), text), units.len() - leading))
}
