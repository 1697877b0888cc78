// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Decompilation of Python's pickle format
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! # What this crate does
//!
//! Pickles are not a declarative format, but a program for a stack-based VM,
//! and unpickling untrusted data famously executes attacker-chosen
//! constructors.  This crate *never* executes a pickle.  It interprets the
//! opcode stream into a symbolic object graph - class lookups, constructor
//! calls and attribute updates are recorded instead of evaluated - and
//! renders that graph as Python-like pseudocode:
//!
//! ```text
//! var_0 = __import__("builtins").list
//! var_0 = var_0(())
//! return var_0
//! ```
//!
//! Shared and self-referential objects (pickle supports both) become
//! variables that are declared once and referenced by name; cycles that
//! cannot be written as literals are completed by trailing statements like
//! `var_0.append(var_0)`.
//!
//! Interpretation is best-effort: on a malformed, truncated or unsupported
//! stream the run stops and the state recovered so far is still rendered,
//! marked as truncated.
//!
//! # Exported API
//!
//! The top-level functions [`decompile_slice`]/[`decompile_reader`] produce
//! pseudocode, [`json_from_slice`]/[`json_from_reader`] a JSON dump of the
//! final machine state; both return a [`Decompiled`] carrying the output
//! text, a completeness flag and the recorded protocol version.  Options
//! (start offset, STOP handling, verbosity) are passed via [`DecOptions`].
//!
//! The intermediate layers are public for callers that want more control:
//! [`dis::Disassembler`] decodes single opcodes, [`Machine`] runs the opcode
//! interpreter, [`render::Dumper`] and [`json::machine_to_json`] consume the
//! final state.

pub use crate::dis::{Arg, Disassembler, Insn};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::json::{machine_to_json, machine_to_string};
pub use crate::machine::{DecOptions, Machine};
pub use crate::obj::{ObjRef, PyKind, PyObj, PyOp, PyOper};
pub use crate::render::{pseudocode, Dumper};

mod consts;
pub mod dis;
pub mod error;
pub mod json;
pub mod machine;
pub mod obj;
pub mod render;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;

use std::io;

/// The outcome of a decompilation run.
pub struct Decompiled {
    /// Pseudocode or JSON text; present (possibly partial) even on failure.
    pub text: String,
    /// False if the run stopped before STOP/EOF.
    pub complete: bool,
    /// Protocol version from a PROTO opcode at the start offset.
    pub protocol: Option<u8>,
    /// The error that stopped an incomplete run.
    pub error: Option<Error>,
}

/// Decompiles a pickle stream into pseudocode.
///
/// This cannot fail: interpretation errors only truncate the output.
pub fn decompile_slice(data: &[u8], opts: &DecOptions) -> Decompiled {
    let mut machine = Machine::new(opts);
    let error = machine.run(data).err();
    let mut text = String::new();
    if let Some(err) = &error {
        log::error!("pickle interpretation stopped: {}", err);
        text.push_str(&format!("# truncated: {}\n", err));
    }
    text.push_str(&render::pseudocode(&machine, error.is_some(), opts.verbose));
    Decompiled {
        text,
        complete: error.is_none(),
        protocol: machine.protocol(),
        error,
    }
}

/// Decompiles a pickle stream read from `rdr` into pseudocode.
pub fn decompile_reader<R: io::Read>(mut rdr: R, opts: &DecOptions) -> io::Result<Decompiled> {
    let mut data = Vec::new();
    rdr.read_to_end(&mut data)?;
    Ok(decompile_slice(&data, opts))
}

/// Interprets a pickle stream and dumps the final machine state as JSON.
pub fn json_from_slice(data: &[u8], opts: &DecOptions) -> Decompiled {
    let mut machine = Machine::new(opts);
    let error = machine.run(data).err();
    if let Some(err) = &error {
        log::error!("pickle interpretation stopped: {}", err);
    }
    let text = match json::machine_to_string(&machine, error.is_some()) {
        Ok(text) => text,
        Err(err) => {
            log::error!("JSON dump failed: {}", err);
            String::from("{}")
        }
    };
    Decompiled {
        text,
        complete: error.is_none(),
        protocol: machine.protocol(),
        error,
    }
}

/// Like [`json_from_slice`], reading the input from `rdr`.
pub fn json_from_reader<R: io::Read>(mut rdr: R, opts: &DecOptions) -> io::Result<Decompiled> {
    let mut data = Vec::new();
    rdr.read_to_end(&mut data)?;
    Ok(json_from_slice(&data, opts))
}
