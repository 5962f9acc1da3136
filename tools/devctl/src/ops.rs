//! Node operation scripts
//!
//! Each operation is one whitespace separated command:
//!
//! ```text
//! read <node> [count]     read from a node (default count 32)
//! write <node> <value>    write a value to a node
//! drive <line> <level>    change a simulated input level
//! peer <byte>             put a byte on the simulated SPI bus
//! list                    list registered nodes
//! ```

use anyhow::{bail, Context, Result};

/// Default read size, matching the node write limit
pub const DEFAULT_COUNT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Read { node: String, count: usize },
    Write { node: String, value: String },
    Drive { line: u32, level: bool },
    Peer(u8),
    List,
}

impl Op {
    pub fn parse(text: &str) -> Result<Self> {
        let words: Vec<&str> = text.split_whitespace().collect();

        let op = match words.as_slice() {
            ["read", node] => Op::Read {
                node: node.to_string(),
                count: DEFAULT_COUNT,
            },
            ["read", node, count] => Op::Read {
                node: node.to_string(),
                count: count.parse().with_context(|| format!("bad count {:?}", count))?,
            },
            ["write", node, value] => Op::Write {
                node: node.to_string(),
                value: value.to_string(),
            },
            ["drive", line, level] => Op::Drive {
                line: line.parse().with_context(|| format!("bad line {:?}", line))?,
                level: match *level {
                    "0" | "low" => false,
                    "1" | "high" => true,
                    other => bail!("bad level {:?}, expected 0/1/low/high", other),
                },
            },
            ["peer", byte] => Op::Peer(byte.parse().with_context(|| format!("bad byte {:?}", byte))?),
            ["list"] => Op::List,
            _ => bail!("unrecognised operation {:?}", text),
        };

        Ok(op)
    }
}

/// Render node output for the terminal
///
/// The trailing NUL terminator is dropped; anything else non-printable is
/// escaped.
pub fn render(data: &[u8]) -> String {
    let data = data.strip_suffix(&[0]).unwrap_or(data);
    data.iter().flat_map(|b| std::ascii::escape_default(*b)).map(char::from).collect()
}
