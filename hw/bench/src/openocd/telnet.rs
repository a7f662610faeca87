// Licensed under the Apache-2.0 license

//! Strips telnet option negotiation from the OpenOCD command port stream.

const IAC: u8 = 255;
const DONT: u8 = 254;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    Option,
    Subneg,
    SubnegIac,
}

/// Byte-level filter. State is carried across calls so a sequence split
/// between two reads is still removed.
#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the payload bytes of `input` to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, 0) => State::Data,
                (State::Data, _) => {
                    out.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.push(IAC);
                    State::Data
                }
                (State::Iac, WILL..=DONT) => State::Option,
                (State::Iac, SB) => State::Subneg,
                (State::Iac, _) => State::Data,
                (State::Option, _) => State::Data,
                (State::Subneg, IAC) => State::SubnegIac,
                (State::Subneg, _) => State::Subneg,
                (State::SubnegIac, SE) => State::Data,
                (State::SubnegIac, _) => State::Subneg,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(chunks: &[&[u8]]) -> Vec<u8> {
        let mut f = TelnetFilter::new();
        let mut out = vec![];
        for c in chunks {
            f.feed(c, &mut out);
        }
        out
    }

    #[test]
    fn test_plain_text_passes() {
        assert_eq!(filter(&[b"Open On-Chip Debugger\r\n> "]), b"Open On-Chip Debugger\r\n> ");
    }

    #[test]
    fn test_negotiation_removed() {
        // IAC WILL ECHO, IAC WILL SGA, IAC DO NAWS, IAC DONT LINEMODE
        let input = [
            255, 251, 1, 255, 251, 3, 255, 253, 31, 255, 254, 34, b'>', b' ',
        ];
        assert_eq!(filter(&[&input]), b"> ");
    }

    #[test]
    fn test_split_across_reads() {
        assert_eq!(filter(&[b"ab\xff", b"\xfb", b"\x01cd"]), b"abcd");
        assert_eq!(filter(&[b"x\xff\xfa\x18\x01", b"\xff\xf0y"]), b"xy");
    }

    #[test]
    fn test_escaped_iac_and_nul() {
        assert_eq!(filter(&[b"a\xff\xffb\0c"]), b"a\xffbc");
    }
}
