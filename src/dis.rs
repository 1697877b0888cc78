// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle opcode disassembly.
//!
//! Decodes a single opcode and its immediate argument from a byte slice.
//! All pickle opcodes are decodable, including the ones the interpreter
//! rejects, so failure reports can carry an accurate mnemonic and size.
//!
//! Protocol 0 opcodes take newline-terminated text arguments (with `\r\n`
//! tolerated); the binary protocols use little-endian length prefixes, except
//! for BINFLOAT which is a big-endian IEEE double.

use std::str;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_bigint::{BigInt, Sign};

use crate::consts::{self, *};
use crate::error::{Error, ErrorCode, Result};
use crate::obj::quoted;

/// A decoded opcode argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    None,
    Int(i64),
    Uint(u64),
    Long(BigInt),
    Float(f64),
    Bytes(Vec<u8>),
    /// Two newline-terminated strings (GLOBAL and INST: module, name).
    Pair(Vec<u8>, Vec<u8>),
}

impl Arg {
    pub(crate) fn int(self, offset: u64) -> Result<i64> {
        match self {
            Arg::Int(v) => Ok(v),
            _ => Err(bad_shape("integer", offset)),
        }
    }

    pub(crate) fn uint(self, offset: u64) -> Result<u64> {
        match self {
            Arg::Uint(v) => Ok(v),
            _ => Err(bad_shape("unsigned integer", offset)),
        }
    }

    pub(crate) fn big(self, offset: u64) -> Result<BigInt> {
        match self {
            Arg::Long(v) => Ok(v),
            _ => Err(bad_shape("long", offset)),
        }
    }

    pub(crate) fn float(self, offset: u64) -> Result<f64> {
        match self {
            Arg::Float(v) => Ok(v),
            _ => Err(bad_shape("float", offset)),
        }
    }

    pub(crate) fn bytes(self, offset: u64) -> Result<Vec<u8>> {
        match self {
            Arg::Bytes(v) => Ok(v),
            _ => Err(bad_shape("string", offset)),
        }
    }

    pub(crate) fn pair(self, offset: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        match self {
            Arg::Pair(a, b) => Ok((a, b)),
            _ => Err(bad_shape("module/name pair", offset)),
        }
    }
}

fn bad_shape(what: &str, offset: u64) -> Error {
    Error::Eval(ErrorCode::InvalidValue(format!("expected {} argument", what)), offset)
}

/// A decoded instruction.
#[derive(Clone, Debug)]
pub struct Insn {
    pub code: u8,
    pub offset: u64,
    pub size: usize,
    pub arg: Arg,
}

impl Insn {
    /// Disassembly-style rendering, for logs and error reports.
    pub fn mnemonic(&self) -> String {
        let name = consts::name(self.code);
        match &self.arg {
            Arg::None => name.into(),
            Arg::Int(v) => format!("{} {}", name, v),
            Arg::Uint(v) => format!("{} {}", name, v),
            Arg::Long(v) => format!("{} {}", name, v),
            Arg::Float(v) => format!("{} {:?}", name, v),
            Arg::Bytes(b) => format!("{} {}", name, quoted(b)),
            Arg::Pair(m, n) => format!("{} {} {}", name,
                                       String::from_utf8_lossy(m), String::from_utf8_lossy(n)),
        }
    }
}

/// Decodes single instructions out of an in-memory pickle stream.
pub struct Disassembler<'a> {
    data: &'a [u8],
}

impl<'a> Disassembler<'a> {
    pub fn new(data: &'a [u8]) -> Disassembler<'a> {
        Disassembler { data }
    }

    /// Decodes the instruction starting at `offset` (an index into the data).
    pub fn disassemble(&self, offset: u64) -> Result<Insn> {
        let mut rdr = Reader { data: self.data, pos: offset as usize, op: offset };
        let code = rdr.byte()?;
        let arg = rdr.arg_for(code)?;
        Ok(Insn { code, offset, size: rdr.pos - offset as usize, arg })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    op: u64,
}

impl<'a> Reader<'a> {
    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.op))
    }

    fn byte(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => self.error(ErrorCode::EofWhileParsing),
        }
    }

    fn bytes(&mut self, n: u64) -> Result<&'a [u8]> {
        let op = self.op;
        let n = usize::try_from(n).map_err(|_| Error::Eval(ErrorCode::EofWhileParsing, op))?;
        let end = match self.pos.checked_add(n) {
            Some(end) => end,
            None => return self.error(ErrorCode::EofWhileParsing),
        };
        match self.data.get(self.pos..end) {
            Some(slice) => {
                self.pos = end;
                Ok(slice)
            }
            None => self.error(ErrorCode::EofWhileParsing),
        }
    }

    fn line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') {
                        result.pop();
                    }
                    return Ok(result);
                }
                ch => result.push(ch),
            }
        }
    }

    fn u8_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.byte()?;
        self.bytes(len as u64)
    }

    fn u32_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = LittleEndian::read_u32(self.bytes(4)?);
        self.bytes(len as u64)
    }

    fn u64_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = LittleEndian::read_u64(self.bytes(8)?);
        self.bytes(len)
    }

    fn i32_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = LittleEndian::read_i32(self.bytes(4)?);
        if len < 0 {
            return self.error(ErrorCode::NegativeLength);
        }
        self.bytes(len as u64)
    }

    fn arg_for(&mut self, code: u8) -> Result<Arg> {
        Ok(match code {
            // no argument
            MARK | STOP | POP | POP_MARK | DUP | NONE | NEWTRUE | NEWFALSE |
            EMPTY_TUPLE | TUPLE | TUPLE1 | TUPLE2 | TUPLE3 |
            EMPTY_LIST | LIST | EMPTY_DICT | DICT | EMPTY_SET | FROZENSET |
            APPEND | APPENDS | SETITEM | SETITEMS | ADDITEMS |
            REDUCE | NEWOBJ | NEWOBJ_EX | BUILD | OBJ | STACK_GLOBAL |
            MEMOIZE | BINPERSID | NEXT_BUFFER | READONLY_BUFFER => Arg::None,

            // small unsigned immediates
            PROTO => Arg::Uint(self.byte()? as u64),
            FRAME => Arg::Uint(LittleEndian::read_u64(self.bytes(8)?)),
            BINGET | BINPUT | EXT1 => Arg::Uint(self.byte()? as u64),
            LONG_BINGET | LONG_BINPUT | EXT4 => Arg::Uint(LittleEndian::read_u32(self.bytes(4)?) as u64),
            EXT2 => Arg::Uint(LittleEndian::read_u16(self.bytes(2)?) as u64),

            // binary-coded numbers
            BININT => Arg::Int(LittleEndian::read_i32(self.bytes(4)?) as i64),
            BININT1 => Arg::Int(self.byte()? as i64),
            BININT2 => Arg::Int(LittleEndian::read_u16(self.bytes(2)?) as i64),
            LONG1 => {
                let bytes = self.u8_prefixed()?;
                Arg::Long(decode_long(bytes))
            }
            LONG4 => {
                let bytes = self.i32_prefixed()?;
                Arg::Long(decode_long(bytes))
            }
            BINFLOAT => Arg::Float(BigEndian::read_f64(self.bytes(8)?)),
            FLOAT => {
                let line = self.line()?;
                match str::from_utf8(&line).unwrap_or("").parse::<f64>() {
                    Ok(f) => Arg::Float(f),
                    Err(_) => return self.error(ErrorCode::InvalidLiteral(line)),
                }
            }

            // until-EOL text arguments
            INT | LONG | GET | PUT | PERSID => Arg::Bytes(self.line()?),
            STRING => {
                let line = self.line()?;
                // Remove quotes.
                let slice = if line.len() >= 2 && line[0] == line[line.len() - 1] &&
                    (line[0] == b'"' || line[0] == b'\'') {
                        &line[1..line.len() - 1]
                    } else {
                        &line[..]
                    };
                Arg::Bytes(self.decode_escaped_string(slice)?)
            }
            UNICODE => {
                let line = self.line()?;
                Arg::Bytes(self.decode_escaped_unicode(&line)?.into_bytes())
            }
            GLOBAL | INST => {
                let module = self.line()?;
                let name = self.line()?;
                Arg::Pair(module, name)
            }

            // length-prefixed (byte)strings
            SHORT_BINSTRING | SHORT_BINBYTES => Arg::Bytes(self.u8_prefixed()?.to_vec()),
            BINSTRING => Arg::Bytes(self.i32_prefixed()?.to_vec()),
            BINBYTES => Arg::Bytes(self.u32_prefixed()?.to_vec()),
            BINBYTES8 | BYTEARRAY8 => Arg::Bytes(self.u64_prefixed()?.to_vec()),
            SHORT_BINUNICODE => {
                let bytes = self.u8_prefixed()?;
                self.checked_unicode(bytes)?
            }
            BINUNICODE => {
                let bytes = self.u32_prefixed()?;
                self.checked_unicode(bytes)?
            }
            BINUNICODE8 => {
                let bytes = self.u64_prefixed()?;
                self.checked_unicode(bytes)?
            }

            _ => return self.error(ErrorCode::InvalidOpcode(code)),
        })
    }

    fn checked_unicode(&self, bytes: &[u8]) -> Result<Arg> {
        match str::from_utf8(bytes) {
            Ok(_) => Ok(Arg::Bytes(bytes.to_vec())),
            Err(_) => self.error(ErrorCode::StringNotUtf8),
        }
    }

    fn decode_escaped_string(&self, s: &[u8]) -> Result<Vec<u8>> {
        // These are encoded with "normal" Python string escape rules.
        let mut result = Vec::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => match iter.next() {
                    Some(&b'\\') => result.push(b'\\'),
                    Some(&b'a') => result.push(b'\x07'),
                    Some(&b'b') => result.push(b'\x08'),
                    Some(&b't') => result.push(b'\x09'),
                    Some(&b'n') => result.push(b'\x0a'),
                    Some(&b'v') => result.push(b'\x0b'),
                    Some(&b'f') => result.push(b'\x0c'),
                    Some(&b'r') => result.push(b'\x0d'),
                    Some(&b'\'') => result.push(b'\''),
                    Some(&b'x') => {
                        match iter.next()
                                  .and_then(|&ch1| (ch1 as char).to_digit(16))
                                  .and_then(|v1| iter.next()
                                            .and_then(|&ch2| (ch2 as char).to_digit(16))
                                            .map(|v2| 16 * (v1 as u8) + (v2 as u8)))
                        {
                            Some(v) => result.push(v),
                            None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                        }
                    }
                    _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                },
                _ => result.push(b),
            }
        }
        Ok(result)
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<String> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  The backslash is escaped
        // in this way, too.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => {
                    let nescape = match iter.next() {
                        Some(&b'u') => 4,
                        Some(&b'U') => 8,
                        _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    };
                    let mut accum = 0;
                    for _ in 0..nescape {
                        accum *= 16;
                        match iter.next().and_then(|&ch| (ch as char).to_digit(16)) {
                            Some(v) => accum += v,
                            None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                        }
                    }
                    match char::from_u32(accum) {
                        Some(v) => result.push(v),
                        None => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    }
                }
                _ => result.push(b as char),
            }
        }
        Ok(result)
    }
}

/// Decodes a little-endian two's-complement long payload (LONG1/LONG4).
fn decode_long(bytes: &[u8]) -> BigInt {
    // BigInt::from_bytes_le doesn't like a sign bit in the bytes, therefore
    // we have to extract that ourselves and do the two-s complement.
    let negative = !bytes.is_empty() && (bytes[bytes.len() - 1] & 0x80 != 0);
    let mut val = BigInt::from_bytes_le(Sign::Plus, bytes);
    if negative {
        val -= BigInt::from(1) << (bytes.len() * 8);
    }
    val
}
