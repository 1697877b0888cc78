// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Command line front-end: decompile a pickle from a file or stdin.

use std::env;
use std::fs::File;
use std::io::{stdin, Read};
use std::process::exit;

use depickle::DecOptions;

fn usage() -> ! {
    println!("Usage: depickle [options] [filename]");
    println!();
    println!("Input is the given file or stdin.");
    println!();
    println!("  -j, --json        dump the machine state as JSON instead of pseudocode");
    println!("  -v, --verbose     add debug commentary to the output");
    println!("  -a, --all         keep going past STOP opcodes");
    println!("  -s, --offset N    start at byte offset N");
    println!("  -h, --help        show this help");
    exit(1);
}

fn main() {
    env_logger::init();

    let mut json = false;
    let mut opts = DecOptions::new();
    let mut filename = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match &*arg {
            "-j" | "--json" => json = true,
            "-v" | "--verbose" => opts = opts.verbose(),
            "-a" | "--all" => opts = opts.run_past_stop(),
            "-s" | "--offset" => {
                let value = args.next().unwrap_or_default();
                match value.parse() {
                    Ok(offset) => opts = opts.offset(offset),
                    Err(_) => {
                        eprintln!("depickle: invalid offset {:?}", value);
                        exit(2);
                    }
                }
            }
            "-h" | "--help" => usage(),
            _ if filename.is_none() && !arg.starts_with('-') => filename = Some(arg),
            _ => usage(),
        }
    }

    let reader: Box<dyn Read> = match &filename {
        Some(name) => match File::open(name) {
            Ok(file) => Box::new(file),
            Err(err) => {
                eprintln!("depickle: {}: {}", name, err);
                exit(2);
            }
        },
        None => Box::new(stdin()),
    };

    let result = if json {
        depickle::json_from_reader(reader, &opts)
    } else {
        depickle::decompile_reader(reader, &opts)
    };
    match result {
        Ok(dec) => {
            println!("{}", dec.text.trim_end_matches('\n'));
            if !dec.complete {
                exit(1);
            }
        }
        Err(err) => {
            eprintln!("depickle: {}", err);
            exit(2);
        }
    }
}
