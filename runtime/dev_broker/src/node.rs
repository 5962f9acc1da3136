//! Node file operations
//!
//! Value encoding shared by every node: reads produce a decimal ASCII value
//! followed by a NUL terminator and are truncated to the caller's count;
//! writes take the first integer token of the payload and ignore the rest.

use std::sync::Arc;

use bitflags::bitflags;

use crate::irq::{CancelToken, InterruptSynchronizer};
use crate::line::{Direction, LineResource};
use crate::registry::DeviceFile;
use crate::{DriverError, Result};

bitflags! {
    /// Operations a node accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeCaps: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Reads may sleep until the next interrupt
        const BLOCKING = 1 << 2;
    }
}

/// Encode a value as decimal ASCII plus a NUL terminator
pub fn format_value(value: i64) -> Vec<u8> {
    let mut buf = value.to_string().into_bytes();
    buf.push(0);
    buf
}

/// Trim an encoded value to at most `count` bytes
pub fn truncate(mut buf: Vec<u8>, count: usize) -> Vec<u8> {
    buf.truncate(count);
    buf
}

/// Integer syntax a node accepts on write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSyntax {
    /// Decimal digits only
    Decimal,
    /// `0x`/`0X` prefix for hex, leading `0` for octal, decimal otherwise
    Prefixed,
}

/// Payload from its first non-whitespace byte up to the first NUL
fn leading_text(data: &[u8]) -> &[u8] {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = &data[..end];
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    &text[start..]
}

/// The part of a write payload an integer is scanned from
///
/// Leading whitespace is skipped however long it is; at most `max_len` bytes
/// are taken from where the token starts.
pub fn token_window(data: &[u8], max_len: usize) -> &[u8] {
    let text = leading_text(data);
    &text[..text.len().min(max_len)]
}

/// Parse the first decimal integer token of a write payload
///
/// Leading ASCII whitespace is skipped, an optional sign is accepted, and
/// parsing stops at the first non-digit (a NUL ends the payload).
///
/// # Errors
/// [`DriverError::InvalidInput`] when no digits follow, or the value
/// overflows `i64`
pub fn parse_first_int(data: &[u8]) -> Result<i64> {
    parse_int_token(data, IntSyntax::Decimal)
}

/// Parse the first integer token of a write payload in the given syntax
pub fn parse_int_token(data: &[u8], syntax: IntSyntax) -> Result<i64> {
    let rest = leading_text(data);

    let negative = rest.first() == Some(&b'-');
    let sign_len = usize::from(matches!(rest.first(), Some(b'+' | b'-')));
    let body = &rest[sign_len..];

    let (radix, skip) = match (syntax, body) {
        (IntSyntax::Prefixed, [b'0', b'x' | b'X', next, ..]) if next.is_ascii_hexdigit() => (16, 2),
        (IntSyntax::Prefixed, [b'0', ..]) => (8, 0),
        _ => (10, 0),
    };
    let digits = body[skip..]
        .iter()
        .take_while(|b| char::from(**b).is_digit(radix))
        .count();

    if digits == 0 {
        return Err(DriverError::InvalidInput(format!(
            "no integer in {:?}",
            String::from_utf8_lossy(rest)
        )));
    }

    // Digits are ASCII, so the token is valid UTF-8
    let magnitude = std::str::from_utf8(&body[skip..skip + digits]).unwrap_or_default();
    let token = if negative { format!("-{}", magnitude) } else { magnitude.to_string() };
    i64::from_str_radix(&token, radix).map_err(|_| DriverError::InvalidInput("integer out of range".into()))
}

/// Node backed by a single line with direct get/set
pub struct LineNode {
    line: LineResource,
    max_write_len: usize,
}

impl LineNode {
    pub fn new(line: LineResource, max_write_len: usize) -> Self {
        Self { line, max_write_len }
    }

    pub fn line(&self) -> &LineResource {
        &self.line
    }
}

impl DeviceFile for LineNode {
    fn caps(&self) -> NodeCaps {
        match self.line.direction() {
            Some(Direction::Output) => NodeCaps::READ | NodeCaps::WRITE,
            _ => NodeCaps::READ,
        }
    }

    fn read(&self, count: usize, _cancel: &CancelToken) -> Result<Vec<u8>> {
        let value = self.line.read()?;
        Ok(truncate(format_value(i64::from(value)), count))
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let value = parse_first_int(token_window(data, self.max_write_len))?;
        self.line.write(value != 0)?;
        Ok(data.len())
    }
}

/// Input line node whose reads wait for the next edge
///
/// The value returned is sampled after the wake, so it reflects the level the
/// edge left behind.
pub struct BlockingLineNode {
    line: LineResource,
    sync: Arc<InterruptSynchronizer>,
}

impl BlockingLineNode {
    pub fn new(line: LineResource, sync: Arc<InterruptSynchronizer>) -> Self {
        Self { line, sync }
    }

    pub fn line(&self) -> &LineResource {
        &self.line
    }

    pub fn synchronizer(&self) -> &Arc<InterruptSynchronizer> {
        &self.sync
    }
}

impl DeviceFile for BlockingLineNode {
    fn caps(&self) -> NodeCaps {
        NodeCaps::READ | NodeCaps::BLOCKING
    }

    fn read(&self, count: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
        self.sync.wait_and_drain(cancel)?;
        let value = self.line.read()?;
        Ok(truncate(format_value(i64::from(value)), count))
    }

    fn quiesce(&self) {
        self.sync.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::EdgeTrigger;
    use crate::line::GpioChip;
    use crate::sim::SimGpioChip;
    use std::time::Duration;

    #[test]
    fn test_format_includes_terminator() {
        assert_eq!(format_value(5), b"5\0".to_vec());
        assert_eq!(format_value(-12), b"-12\0".to_vec());
        assert_eq!(format_value(255), b"255\0".to_vec());
    }

    #[test]
    fn test_truncate_never_splits_past_count() {
        assert_eq!(truncate(format_value(5), 1), b"5".to_vec());
        assert_eq!(truncate(format_value(5), 2), b"5\0".to_vec());
        assert_eq!(truncate(format_value(5), 64), b"5\0".to_vec());
        assert!(truncate(format_value(5), 0).is_empty());
    }

    #[test]
    fn test_parse_first_int() {
        assert_eq!(parse_first_int(b"1").unwrap(), 1);
        assert_eq!(parse_first_int(b"0\n").unwrap(), 0);
        assert_eq!(parse_first_int(b"  42 17").unwrap(), 42);
        assert_eq!(parse_first_int(b"-3xyz").unwrap(), -3);
        assert_eq!(parse_first_int(b"+7").unwrap(), 7);
        assert_eq!(parse_first_int(b"9\0garbage").unwrap(), 9);
    }

    #[test]
    fn test_parse_rejects_non_numbers() {
        assert!(matches!(parse_first_int(b""), Err(DriverError::InvalidInput(_))));
        assert!(matches!(parse_first_int(b"on"), Err(DriverError::InvalidInput(_))));
        assert!(matches!(parse_first_int(b"-"), Err(DriverError::InvalidInput(_))));
        assert!(matches!(parse_first_int(b"\01"), Err(DriverError::InvalidInput(_))));
        assert!(matches!(
            parse_first_int(b"99999999999999999999"),
            Err(DriverError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_prefixed_syntax() {
        assert_eq!(parse_int_token(b"0x2a", IntSyntax::Prefixed).unwrap(), 42);
        assert_eq!(parse_int_token(b"0XFF\n", IntSyntax::Prefixed).unwrap(), 255);
        assert_eq!(parse_int_token(b"017", IntSyntax::Prefixed).unwrap(), 15);
        assert_eq!(parse_int_token(b"-010", IntSyntax::Prefixed).unwrap(), -8);
        assert_eq!(parse_int_token(b"0", IntSyntax::Prefixed).unwrap(), 0);
        assert_eq!(parse_int_token(b"19", IntSyntax::Prefixed).unwrap(), 19);
        // No hex digit after the prefix: the leading zero is the whole token
        assert_eq!(parse_int_token(b"0xg", IntSyntax::Prefixed).unwrap(), 0);
        assert_eq!(parse_int_token(b"09", IntSyntax::Prefixed).unwrap(), 0);

        assert_eq!(parse_int_token(b"0x2a", IntSyntax::Decimal).unwrap(), 0);
        assert_eq!(parse_int_token(b"017", IntSyntax::Decimal).unwrap(), 17);
        assert!(matches!(
            parse_int_token(b"x10", IntSyntax::Prefixed),
            Err(DriverError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_token_window() {
        assert_eq!(token_window(b"12345", 3), b"123");
        assert_eq!(token_window(b"12", 32), b"12");
        assert_eq!(token_window(b"   \t7 tail", 3), b"7 t");
        assert_eq!(token_window(b"5\0junk", 32), b"5");
        assert!(token_window(b"    ", 2).is_empty());
    }

    #[test]
    fn test_line_node_write_then_read() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let mut line = LineResource::acquire(chip.clone(), 21).unwrap();
        line.set_direction(Direction::Output).unwrap();
        let node = LineNode::new(line, 32);

        assert_eq!(node.caps(), NodeCaps::READ | NodeCaps::WRITE);
        assert_eq!(node.write(b"1\n").unwrap(), 2);
        assert_eq!(node.read(16, &CancelToken::new()).unwrap(), b"1\0".to_vec());

        // Any non-zero value drives the line high
        node.write(b"7").unwrap();
        assert_eq!(node.read(1, &CancelToken::new()).unwrap(), b"1".to_vec());

        node.write(b"0").unwrap();
        assert_eq!(node.read(1, &CancelToken::new()).unwrap(), b"0".to_vec());
    }

    #[test]
    fn test_line_node_write_consumes_whole_payload() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let mut line = LineResource::acquire(chip.clone(), 21).unwrap();
        line.set_direction(Direction::Output).unwrap();
        let node = LineNode::new(line, 4);

        assert_eq!(node.write(b"1 and a long tail").unwrap(), 17);
        assert_eq!(node.read(1, &CancelToken::new()).unwrap(), b"1".to_vec());
    }

    #[test]
    fn test_line_node_write_past_the_cap() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let mut line = LineResource::acquire(chip.clone(), 21).unwrap();
        line.set_direction(Direction::Output).unwrap();
        let node = LineNode::new(line, 32);

        // Whitespace longer than the cap before the token
        let mut padded = vec![b' '; 40];
        padded.push(b'1');
        assert_eq!(node.write(&padded).unwrap(), 41);
        assert_eq!(node.read(1, &CancelToken::new()).unwrap(), b"1".to_vec());

        node.write(b"0").unwrap();

        // A trailing token beyond the cap is ignored, not left for a retry
        let mut tail = b"1".to_vec();
        tail.extend_from_slice(&[b' '; 39]);
        tail.push(b'0');
        assert_eq!(node.write(&tail).unwrap(), 41);
        assert_eq!(node.read(1, &CancelToken::new()).unwrap(), b"1".to_vec());
    }

    #[test]
    fn test_input_line_node_is_read_only() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let mut line = LineResource::acquire(chip.clone(), 16).unwrap();
        line.set_direction(Direction::Input).unwrap();
        let node = LineNode::new(line, 32);

        assert_eq!(node.caps(), NodeCaps::READ);
        assert!(matches!(node.write(b"1"), Err(DriverError::InvalidOperation(_))));
    }

    #[test]
    fn test_blocking_node_reads_post_edge_value() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let mut line = LineResource::acquire(chip.clone(), 16).unwrap();
        line.set_direction(Direction::Input).unwrap();
        chip.drive(16, true).unwrap();

        let sync = Arc::new(InterruptSynchronizer::new(Duration::from_millis(5)));
        chip.request_irq(16, EdgeTrigger::Falling, sync.handler()).unwrap();
        let node = BlockingLineNode::new(line, sync);

        chip.drive(16, false).unwrap();
        assert_eq!(node.read(8, &CancelToken::new()).unwrap(), b"0\0".to_vec());
    }

    #[test]
    fn test_blocking_node_quiesce_cancels() {
        let chip = Arc::new(SimGpioChip::new("gpiochip0", 32));
        let line = LineResource::acquire(chip.clone(), 16).unwrap();
        let sync = Arc::new(InterruptSynchronizer::new(Duration::from_millis(5)));
        let node = BlockingLineNode::new(line, sync);

        node.quiesce();
        assert!(matches!(node.read(8, &CancelToken::new()), Err(DriverError::Cancelled)));
    }
}
