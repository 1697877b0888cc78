// Copyright (c) 2022-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

mod dis_tests {
    use crate::dis::{Arg, Disassembler};
    use crate::error::{Error, ErrorCode};
    use num_bigint::BigInt;

    fn dis_one(data: &[u8]) -> (u8, usize, Arg) {
        let insn = Disassembler::new(data).disassemble(0).unwrap();
        (insn.code, insn.size, insn.arg)
    }

    fn dis_err(data: &[u8]) -> (ErrorCode, u64) {
        match Disassembler::new(data).disassemble(0) {
            Err(Error::Eval(code, offset)) => (code, offset),
            other => panic!("expected eval error, got {:?}", other.map(|i| i.mnemonic())),
        }
    }

    #[test]
    fn binary_ints() {
        assert_eq!(dis_one(b"K\x2a"), (b'K', 2, Arg::Int(42)));
        assert_eq!(dis_one(b"M\x34\x12"), (b'M', 3, Arg::Int(0x1234)));
        assert_eq!(dis_one(b"J\xff\xff\xff\xff"), (b'J', 5, Arg::Int(-1)));
    }

    #[test]
    fn longs() {
        assert_eq!(dis_one(b"\x8a\x00"), (0x8a, 2, Arg::Long(BigInt::from(0))));
        assert_eq!(dis_one(b"\x8a\x01\xff"), (0x8a, 3, Arg::Long(BigInt::from(-1))));
        assert_eq!(dis_one(b"\x8a\x02\x00\x01"), (0x8a, 4, Arg::Long(BigInt::from(256))));
        assert_eq!(dis_one(b"\x8b\x01\x00\x00\x00\x7f"), (0x8b, 6, Arg::Long(BigInt::from(127))));
    }

    #[test]
    fn floats() {
        assert_eq!(dis_one(b"F1.5\n"), (b'F', 5, Arg::Float(1.5)));
        assert_eq!(dis_one(b"G\x3f\xf3\x33\x33\x33\x33\x33\x33"), (b'G', 9, Arg::Float(1.2)));
    }

    #[test]
    fn strings() {
        assert_eq!(dis_one(b"U\x02hi"), (b'U', 4, Arg::Bytes(b"hi".to_vec())));
        assert_eq!(dis_one(b"S'a\\nb'\n"), (b'S', 8, Arg::Bytes(b"a\nb".to_vec())));
        assert_eq!(dis_one(b"Vab\\u0041\n"), (b'V', 10, Arg::Bytes(b"abA".to_vec())));
        assert_eq!(dis_one(b"X\x02\x00\x00\x00hi"), (b'X', 7, Arg::Bytes(b"hi".to_vec())));
    }

    #[test]
    fn globals() {
        assert_eq!(dis_one(b"cbuiltins\nlist\n"),
                   (b'c', 15, Arg::Pair(b"builtins".to_vec(), b"list".to_vec())));
        assert_eq!(dis_one(b"ifoo\nBar\n"),
                   (b'i', 9, Arg::Pair(b"foo".to_vec(), b"Bar".to_vec())));
    }

    #[test]
    fn memo_args() {
        assert_eq!(dis_one(b"q\x07"), (b'q', 2, Arg::Uint(7)));
        assert_eq!(dis_one(b"j\x01\x02\x00\x00"), (b'j', 5, Arg::Uint(0x201)));
        assert_eq!(dis_one(b"\x94"), (0x94, 1, Arg::None));
    }

    #[test]
    fn errors() {
        assert_eq!(dis_err(b"K"), (ErrorCode::EofWhileParsing, 0));
        assert_eq!(dis_err(b"\xff"), (ErrorCode::InvalidOpcode(0xff), 0));
        assert_eq!(dis_err(b"T\xff\xff\xff\xff"), (ErrorCode::NegativeLength, 0));
        assert_eq!(dis_err(b"X\x01\x00\x00\x00\xff"), (ErrorCode::StringNotUtf8, 0));
        assert_eq!(dis_err(b"F1.5.3\n"), (ErrorCode::InvalidLiteral(b"1.5.3".to_vec()), 0));
    }

    #[test]
    fn mnemonics() {
        let dis = Disassembler::new(b"K\x2acbuiltins\nlist\n");
        assert_eq!(dis.disassemble(0).unwrap().mnemonic(), "binint1 42");
        assert_eq!(dis.disassemble(2).unwrap().mnemonic(), "global builtins list");
    }
}

mod machine_tests {
    use std::collections::HashSet;
    use std::rc::Rc;

    use crate::error::{Error, ErrorCode};
    use crate::machine::{DecOptions, Machine};
    use crate::obj::{ObjRef, PyKind, PyObj, PyOp};

    pub fn run(data: &[u8]) -> Machine {
        let mut m = Machine::new(&DecOptions::new());
        m.run(data).unwrap();
        m
    }

    fn run_err(data: &[u8]) -> (ErrorCode, u64) {
        let mut m = Machine::new(&DecOptions::new());
        match m.run(data) {
            Err(Error::Eval(code, offset)) => (code, offset),
            other => panic!("expected eval error, got {:?}", other),
        }
    }

    /// All distinct objects reachable from the stacks.
    pub fn reachable(m: &Machine) -> Vec<ObjRef> {
        let mut seen: HashSet<*const PyObj> = HashSet::new();
        let mut out = Vec::new();
        let mut work: Vec<ObjRef> = m.stack().to_vec();
        work.extend(m.popstack().iter().cloned());
        for frame in m.metastack() {
            work.extend(frame.iter().cloned());
        }
        while let Some(obj) = work.pop() {
            if !seen.insert(Rc::as_ptr(&obj)) {
                continue;
            }
            match &*obj.kind.borrow() {
                PyKind::Tuple(items) | PyKind::List(items) | PyKind::Set(items) |
                PyKind::FrozenSet(items) | PyKind::Dict(items) =>
                    work.extend(items.iter().cloned()),
                PyKind::Func { module, name } => {
                    work.push(module.clone());
                    work.push(name.clone());
                }
                PyKind::What(chain) => {
                    for oper in chain {
                        work.extend(oper.stack.borrow().iter().cloned());
                    }
                }
                PyKind::Split(oper) => work.extend(oper.stack.borrow().iter().cloned()),
                _ => {}
            }
            out.push(obj);
        }
        out
    }

    #[test]
    fn pop_and_popstack() {
        let m = run(b"K\x2a0.");
        assert!(m.stack().is_empty());
        assert_eq!(m.popstack().len(), 1);
        assert!(matches!(&*m.popstack()[0].kind.borrow(), PyKind::Int(42)));
    }

    #[test]
    fn pop_mark_restores() {
        let m = run(b"\x80\x02(K\x2aK\x2bK\x2cK\x2d1.");
        assert!(m.stack().is_empty());
        assert!(m.metastack().is_empty());
        assert_eq!(m.popstack().len(), 4);
        assert_eq!(m.protocol(), Some(2));
    }

    #[test]
    fn memo_holds_shared_reference() {
        // list in the memo is the list on the stack and in the popstack
        let m = run(b"\x80\x02]q\x01K\x2aa0h\x01.");
        assert_eq!(m.stack().len(), 1);
        assert!(Rc::ptr_eq(&m.stack()[0], &m.popstack()[0]));
        assert!(Rc::ptr_eq(&m.stack()[0], &m.memo()[&1]));
        assert_eq!(m.stack()[0].memo_id.get(), Some(1));
    }

    #[test]
    fn memo_reachability_invariant() {
        for data in [
            &b"\x80\x02]q\x01K\x2aa0h\x01."[..],
            b"](K\x01q\x05K\x02q\x06e.",
            b"}q\x00h\x00h\x00s.",
            b"cmod\ncls\n)Rq\x00](h\x00e\x85R.",
        ] {
            let m = run(data);
            let seen = reachable(&m);
            for obj in m.memo().values() {
                assert!(seen.iter().any(|o| Rc::ptr_eq(o, obj)),
                        "memo object not stack-reachable");
            }
        }
    }

    #[test]
    fn what_chains_start_with_init() {
        let m = run(b"cmod\ncls\n)R}bK\x01a.");
        let mut whats = 0;
        for obj in reachable(&m) {
            if let PyKind::What(chain) = &*obj.kind.borrow() {
                whats += 1;
                assert!(!chain.is_empty());
                assert_eq!(chain[0].op, PyOp::FakeInit);
                assert_eq!(chain[0].stack.borrow().len(), 1);
            }
        }
        assert_eq!(whats, 1);
    }

    #[test]
    fn dicts_stay_paired() {
        // splits are watermarks, not elements; everything else pairs up
        let m = run(b"cmod\ncls\n}(K\x01K\x02u\x85R.");
        for obj in reachable(&m) {
            if let PyKind::Dict(items) = &*obj.kind.borrow() {
                let real = items.iter()
                                .filter(|e| !matches!(&*e.kind.borrow(), PyKind::Split(_)))
                                .count();
                assert_eq!(real % 2, 0);
            }
        }
    }

    #[test]
    fn self_referential_list() {
        let m = run(b"]2a.");
        assert_eq!(m.stack().len(), 1);
        let top = &m.stack()[0];
        match &*top.kind.borrow() {
            PyKind::List(items) => {
                assert_eq!(items.len(), 1);
                assert!(Rc::ptr_eq(&items[0], top));
            }
            _ => panic!("expected list"),
        };
    }

    #[test]
    fn reduce_inserts_split() {
        // the list argument gets a trailing split owned by the reduce
        let m = run(b"cbuiltins\nlist\n](K\x01K\x02e\x85R.");
        let what = &m.stack()[0];
        let chain = match &*what.kind.borrow() {
            PyKind::What(chain) => chain.clone(),
            _ => panic!("expected what"),
        };
        assert_eq!(chain[1].op, PyOp::Reduce);
        let tuple = chain[1].stack.borrow()[0].clone();
        let list = match &*tuple.kind.borrow() {
            PyKind::Tuple(items) => items[0].clone(),
            _ => panic!("expected tuple"),
        };
        match &*list.kind.borrow() {
            PyKind::List(items) => {
                assert_eq!(items.len(), 3);
                match &*items[2].kind.borrow() {
                    PyKind::Split(oper) => assert!(Rc::ptr_eq(oper, &chain[1])),
                    _ => panic!("expected trailing split"),
                }
            }
            _ => panic!("expected list"),
        };
    }

    #[test]
    fn split_not_duplicated() {
        // two reduces over the same argument container coalesce their splits
        let m = run(b"cbuiltins\nlist\n]\x85R\x94cbuiltins\nlist\nh\x00\x85R.");
        let mut splits = 0;
        for obj in reachable(&m) {
            if let PyKind::List(items) = &*obj.kind.borrow() {
                splits = items.iter()
                              .filter(|e| matches!(&*e.kind.borrow(), PyKind::Split(_)))
                              .count();
            }
        }
        assert_eq!(splits, 1);
    }

    #[test]
    fn unsupported_opcodes_halt() {
        assert_eq!(run_err(b"I42\n."), (ErrorCode::Unsupported(b'I'), 0));
        assert_eq!(run_err(b"P1\n."), (ErrorCode::Unsupported(b'P'), 0));
        assert_eq!(run_err(b"K\x01\x82\x00."), (ErrorCode::Unsupported(0x82), 2));
    }

    #[test]
    fn arity_errors() {
        assert_eq!(run_err(b"0.").0, ErrorCode::StackUnderflow);
        assert_eq!(run_err(b"2.").0, ErrorCode::StackUnderflow);
        assert_eq!(run_err(b"K\x01a.").0, ErrorCode::StackUnderflow);
        assert_eq!(run_err(b"1.").0, ErrorCode::NoMark);
        assert_eq!(run_err(b"]e.").0, ErrorCode::NoMark);
        assert_eq!(run_err(b"h\x00.").0, ErrorCode::MissingMemo(0));
        assert_eq!(run_err(b"(K\x01d.").0, ErrorCode::OddDictItems);
        assert_eq!(run_err(b"}(K\x01u.").0, ErrorCode::OddDictItems);
        assert_eq!(run_err(b"K\x01K\x02\x93.").0,
                   ErrorCode::InvalidStackTop("str", "int".into()));
    }

    #[test]
    fn end_offset_stops_the_run() {
        let mut m = Machine::new(&DecOptions::new().end(2));
        m.run(b"K\x01K\x02.").unwrap();
        assert_eq!(m.stack().len(), 1);
        assert_eq!(m.offset(), 2);
    }

    #[test]
    fn deep_release_frees_cycles() {
        let weak = {
            let m = run(b"]2a.");
            Rc::downgrade(&m.stack()[0])
        };
        // the machine dropped; the self-referential list must be gone
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn deep_release_frees_reduce_cycles() {
        let (what, list) = {
            let m = run(b"cbuiltins\nlist\n)R\x94](h\x00e\x85R.");
            let what = m.stack()[0].clone();
            let chain = match &*what.kind.borrow() {
                PyKind::What(chain) => chain.clone(),
                _ => panic!("expected what"),
            };
            let tuple = chain[2].stack.borrow()[0].clone();
            let list = match &*tuple.kind.borrow() {
                PyKind::Tuple(items) => items[0].clone(),
                _ => panic!("expected tuple"),
            };
            (Rc::downgrade(&what), Rc::downgrade(&list))
        };
        assert!(what.upgrade().is_none());
        assert!(list.upgrade().is_none());
    }
}

mod render_tests {
    use crate::{decompile_slice, DecOptions};

    fn decompile(data: &[u8]) -> String {
        let dec = decompile_slice(data, &DecOptions::new());
        assert!(dec.complete, "unexpected truncation: {}", dec.text);
        dec.text
    }

    #[test]
    fn scenario_memoized_list() {
        assert_eq!(decompile(b"]\x94."), "var_0 = []\nreturn var_0\n");
    }

    #[test]
    fn scenario_appends() {
        assert_eq!(decompile(b"](K\x01K\x02K\x03e."),
                   "var_0 = [1, 2, 3]\nreturn var_0\n");
    }

    #[test]
    fn scenario_self_referential_list() {
        assert_eq!(decompile(b"]2a."),
                   "var_0 = []\nvar_0.append(var_0)\nreturn var_0\n");
    }

    #[test]
    fn scenario_reduce() {
        assert_eq!(decompile(b"cbuiltins\nlist\n)R."),
                   "var_0 = __import__(\"builtins\").list\n\
                    var_0 = var_0(())\n\
                    return var_0\n");
    }

    #[test]
    fn scenario_reduce_with_list_arg() {
        assert_eq!(decompile(b"cbuiltins\nlist\n](K\x01K\x02e\x85R."),
                   "var_1 = [1, 2]\n\
                    var_0 = __import__(\"builtins\").list\n\
                    var_0 = var_0((var_1,))\n\
                    return var_0\n");
    }

    #[test]
    fn scenario_reduce_cycle() {
        // the reduce's own result is referenced from its argument list:
        // the literal is cut and completed by a trailing append
        assert_eq!(decompile(b"cbuiltins\nlist\n)R\x94](h\x00e\x85R."),
                   "var_1 = []\n\
                    var_0 = __import__(\"builtins\").list\n\
                    var_0 = var_0(())\n\
                    var_0 = var_0((var_1,))\n\
                    var_1.append(var_0)\n\
                    return var_0\n");
    }

    #[test]
    fn leaves() {
        assert_eq!(decompile(b"N."), "return None\n");
        assert_eq!(decompile(b"\x88."), "return True\n");
        assert_eq!(decompile(b"\x89."), "return False\n");
        assert_eq!(decompile(b"J\xff\xff\xff\xff."), "return -1\n");
        assert_eq!(decompile(b"\x8a\x02\x00\x01."), "return 256\n");
        assert_eq!(decompile(b"F1.5\n."), "return 1.5\n");
        assert_eq!(decompile(b"G\x3f\xf3\x33\x33\x33\x33\x33\x33."), "return 1.2\n");
        assert_eq!(decompile(b"U\x02hi."), "return \"hi\"\n");
        assert_eq!(decompile(b"C\x02\x00\xff."), "return \"\\x00\\xff\"\n");
    }

    #[test]
    fn containers() {
        assert_eq!(decompile(b"K\x05\x85."), "var_0 = (5,)\nreturn var_0\n");
        assert_eq!(decompile(b"K\x01K\x02\x86."), "var_0 = (1, 2)\nreturn var_0\n");
        assert_eq!(decompile(b"K\x01K\x02K\x03\x87."), "var_0 = (1, 2, 3)\nreturn var_0\n");
        assert_eq!(decompile(b"(K\x01K\x02t."), "var_0 = (1, 2)\nreturn var_0\n");
        assert_eq!(decompile(b"(K\x01l."), "var_0 = [1]\nreturn var_0\n");
        assert_eq!(decompile(b"(K\x01K\x02d."), "var_0 = {1: 2}\nreturn var_0\n");
        assert_eq!(decompile(b"}(K\x01K\x02u."), "var_0 = {1: 2}\nreturn var_0\n");
        assert_eq!(decompile(b"\x8f(K\x01K\x02\x90."), "var_0 = {1, 2}\nreturn var_0\n");
        assert_eq!(decompile(b"(K\x01K\x02\x91."),
                   "var_0 = frozenset({1, 2})\nreturn var_0\n");
        assert_eq!(decompile(b"\x8f."), "var_0 = set()\nreturn var_0\n");
        assert_eq!(decompile(b"(\x91."), "var_0 = frozenset()\nreturn var_0\n");
        assert_eq!(decompile(b")."), "var_0 = ()\nreturn var_0\n");
    }

    #[test]
    fn shared_objects_render_once() {
        // memoized int appears twice in the list, but is declared once
        assert_eq!(decompile(b"](K\x2aq\x00h\x00e."),
                   "var_0 = 42\nvar_1 = [var_0, var_0]\nreturn var_1\n");
    }

    #[test]
    fn memo_cycle_via_get() {
        assert_eq!(decompile(b"]q\x00h\x00a."),
                   "var_0 = []\nvar_0.append(var_0)\nreturn var_0\n");
    }

    #[test]
    fn dict_cycle() {
        assert_eq!(decompile(b"}q\x00h\x00h\x00s."),
                   "var_0 = {}\nvar_0[var_0] = var_0\nreturn var_0\n");
    }

    #[test]
    fn cycle_behind_tuple() {
        // list contains a tuple that contains the list
        assert_eq!(decompile(b"]q\x00h\x00\x85a."),
                   "var_0 = []\nvar_0.append((var_0,))\nreturn var_0\n");
    }

    #[test]
    fn stack_global() {
        assert_eq!(decompile(b"\x8c\x03mod\x8c\x03cls\x93."),
                   "return __import__(\"mod\").cls\n");
    }

    #[test]
    fn newobj() {
        assert_eq!(decompile(b"cmod\ncls\n)\x81."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0.__new__(var_0, *())\n\
                    return var_0\n");
    }

    #[test]
    fn build_state() {
        assert_eq!(decompile(b"cmod\ncls\n)R}b."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.__setstate__({})\n\
                    return var_0\n");
    }

    #[test]
    fn build_with_self_referential_state() {
        // the state dict refers back to the object under construction
        assert_eq!(decompile(b"cmod\ncls\n)Rq\x00}(S'x'\nh\x00ub."),
                   "var_1 = {}\n\
                    var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.__setstate__(var_1)\n\
                    var_1[\"x\"] = var_0\n\
                    return var_0\n");
    }

    #[test]
    fn mutations_on_unresolved_objects() {
        assert_eq!(decompile(b"cmod\ncls\n)RK\x01a."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.append(1)\n\
                    return var_0\n");
        assert_eq!(decompile(b"cmod\ncls\n)R(K\x01K\x02e."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.extend([1, 2])\n\
                    return var_0\n");
        assert_eq!(decompile(b"cmod\ncls\n)R(K\x01K\x02u."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.update({1: 2})\n\
                    return var_0\n");
        assert_eq!(decompile(b"cmod\ncls\n)R(K\x01K\x02\x90."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0.update({1, 2})\n\
                    return var_0\n");
        assert_eq!(decompile(b"cmod\ncls\n)RS'k'\nK\x02s."),
                   "var_0 = __import__(\"mod\").cls\n\
                    var_0 = var_0(())\n\
                    var_0[\"k\"] = 2\n\
                    return var_0\n");
    }

    #[test]
    fn inst_and_obj() {
        assert_eq!(decompile(b"(K\x01K\x02ifoo\nBar\n."),
                   "var_0 = __import__(\"foo\").Bar\n\
                    var_0 = var_0([1, 2])\n\
                    return var_0\n");
        assert_eq!(decompile(b"(cfoo\nBar\nK\x01o."),
                   "var_0 = __import__(\"foo\").Bar\n\
                    var_0 = var_0([1])\n\
                    return var_0\n");
    }

    #[test]
    fn multiple_pickles() {
        let dec = decompile_slice(b"K\x01.K\x02.", &DecOptions::new().run_past_stop());
        assert!(dec.complete);
        assert_eq!(dec.text, "var_0 = 1\nreturn 2\n");
    }

    #[test]
    fn start_offset() {
        let dec = decompile_slice(b"XXK\x07.", &DecOptions::new().offset(2));
        assert!(dec.complete);
        assert_eq!(dec.text, "return 7\n");
    }

    #[test]
    fn empty_input() {
        assert_eq!(decompile(b""), "# empty stack\n");
        assert_eq!(decompile(b"."), "# empty stack\n");
    }

    #[test]
    fn protocol_is_recorded() {
        let dec = decompile_slice(b"\x80\x04N.", &DecOptions::new());
        assert_eq!(dec.protocol, Some(4));
        // PROTO not at the start offset is only a warning
        let dec = decompile_slice(b"N\x80\x04.", &DecOptions::new());
        assert!(dec.complete);
        assert_eq!(dec.protocol, None);
    }

    #[test]
    fn truncated_output_is_partial() {
        let dec = decompile_slice(b"K\x01I42\n.", &DecOptions::new());
        assert!(!dec.complete);
        assert!(dec.error.is_some());
        assert!(dec.text.starts_with("# truncated: "));
        assert!(dec.text.contains("var_0 = 1\n"));
        // no `return` for a run that did not finish
        assert!(!dec.text.contains("return"));
    }

    #[test]
    fn truncated_dumps_open_mark_frames() {
        let dec = decompile_slice(b"K\x01(K\x02I42\n.", &DecOptions::new());
        assert!(!dec.complete);
        assert!(dec.text.contains("# unclosed MARK frame 0\n"));
        // the current stack dumps first, then the frames left open
        assert!(dec.text.contains("var_0 = 2\n"));
        assert!(dec.text.contains("var_1 = 1\n"));
    }

    #[test]
    fn verbose_commentary() {
        let dec = decompile_slice(b"]\x94.", &DecOptions::new().verbose());
        assert!(dec.text.contains("## stack len 1"));
        assert!(dec.text.contains("TOP"));
    }

    #[test]
    fn garbage_streams_do_not_panic() {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut stream = [0u8; 400];
            rng.fill_bytes(&mut stream);
            let _ = decompile_slice(&stream, &DecOptions::new());
        }
    }
}

mod json_tests {
    use serde_json::json;

    use super::machine_tests::run;
    use crate::json::machine_to_json;
    use crate::{json_from_slice, DecOptions};

    #[test]
    fn ints_on_stack() {
        let m = run(b"\x80\x01K\x2aK\x2b.");
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [
                {"offset": 4, "type": "int", "value": 43},
                {"offset": 2, "type": "int", "value": 42},
            ],
            "popstack": [],
            "memo": [],
            "truncated": false,
        }));
    }

    #[test]
    fn popstack_order_is_top_first() {
        let m = run(b"\x80\x02(K\x2aK\x2bK\x2cK\x2d1.");
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [],
            "popstack": [
                {"offset": 9, "type": "int", "value": 45},
                {"offset": 7, "type": "int", "value": 44},
                {"offset": 5, "type": "int", "value": 43},
                {"offset": 3, "type": "int", "value": 42},
            ],
            "memo": [],
            "truncated": false,
        }));
    }

    #[test]
    fn memo_entries_are_duplicated() {
        let m = run(b"\x80\x02]q\x01K\x2aa0h\x01.");
        let list = json!({
            "offset": 2, "type": "list",
            "value": [{"offset": 5, "type": "int", "value": 42}],
        });
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [list.clone()],
            "popstack": [list.clone()],
            "memo": [{"index": 1, "value": list}],
            "truncated": false,
        }));
    }

    #[test]
    fn recursion_marker() {
        let m = run(b"]2a.");
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [{
                "offset": 0, "type": "list",
                "value": [{"offset": 0, "type": "recursion"}],
            }],
            "popstack": [],
            "memo": [],
            "truncated": false,
        }));
    }

    #[test]
    fn what_chain_dump() {
        let m = run(b"cbuiltins\nlist\n)R.");
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [{
                "offset": 16, "type": "what",
                "value": [
                    {"op": "init", "offset": 16, "args": [
                        {"offset": 0, "type": "func",
                         "value": {"module": "builtins", "name": "list"}},
                    ]},
                    {"op": "reduce", "offset": 16, "args": [
                        {"offset": 15, "type": "tuple", "value": []},
                    ]},
                ],
            }],
            "popstack": [],
            "memo": [],
            "truncated": false,
        }));
    }

    #[test]
    fn dict_dumps_as_pairs() {
        let m = run(b"}(K\x01K\x02u.");
        assert_eq!(machine_to_json(&m, false).unwrap(), json!({
            "stack": [{
                "offset": 0, "type": "dict",
                "value": [[
                    {"offset": 2, "type": "int", "value": 1},
                    {"offset": 4, "type": "int", "value": 2},
                ]],
            }],
            "popstack": [],
            "memo": [],
            "truncated": false,
        }));
    }

    #[test]
    fn truncated_flag_and_metastack() {
        let dec = json_from_slice(b"K\x01(K\x02I42\n.", &DecOptions::new());
        assert!(!dec.complete);
        let v: serde_json::Value = serde_json::from_str(&dec.text).unwrap();
        assert_eq!(v["truncated"], json!(true));
        assert_eq!(v["metastack"], json!([[{"offset": 0, "type": "int", "value": 1}]]));
        assert_eq!(v["stack"], json!([{"offset": 3, "type": "int", "value": 2}]));
    }
}
