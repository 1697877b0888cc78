// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::error;
use std::fmt;
use std::io;
use std::result;

use crate::consts;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Opcode is valid pickle but not handled by the symbolic machine
    Unsupported(u8),
    /// Byte is not a pickle opcode at all
    InvalidOpcode(u8),
    /// EOF while reading an opcode argument
    EofWhileParsing,
    /// Stack underflowed
    StackUnderflow,
    /// Opcode needs a MARK-delimited stack, but none is open
    NoMark,
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUtf8,
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// A dict was about to be built from an odd number of stack items
    OddDictItems,
    /// A value was missing from the memo
    MissingMemo(u64),
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Opcode argument had an unexpected shape (disassembler bug)
    InvalidValue(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::Unsupported(code) =>
                write!(fmt, "unsupported opcode {} ({:#04x})", consts::name(code), code),
            ErrorCode::InvalidOpcode(code) =>
                write!(fmt, "invalid opcode byte {:#04x}", code),
            ErrorCode::EofWhileParsing => write!(fmt, "EOF while parsing"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::NoMark => write!(fmt, "no MARK-delimited stack open"),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUtf8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::OddDictItems => write!(fmt, "dict built from odd number of items"),
            ErrorCode::MissingMemo(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::InvalidValue(ref s) => write!(fmt, "invalid value: {}", s),
        }
    }
}

/// This type represents all possible errors that can occur when disassembling
/// or interpreting a pickle stream.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when reading the input.
    Io(io::Error),
    /// The pickle had some error while disassembling or interpreting;
    /// the second member is the offset of the offending opcode.
    Eval(ErrorCode, u64),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Eval(ref code, offset) =>
                write!(fmt, "eval error at offset {:#x}: {}", offset, code),
        }
    }
}

impl error::Error for Error {}
