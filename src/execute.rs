use crate::debug_println;
use crate::error::*;
use crate::instantiate::Instance;
use crate::types::FuncIdx;
use crate::value::Value;

/// Call depth ceiling; every call recurses with depth + 1 and anything at or
/// past the ceiling traps before running user code.
pub const CALL_STACK_LIMIT: u32 = 2048;

/// The outcome of one execution. A trap carries no value by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionResult {
    Trapped,
    Void,
    Value(Value),
}

impl ExecutionResult {
    #[inline]
    pub fn trapped(&self) -> bool {
        matches!(self, ExecutionResult::Trapped)
    }
    #[inline]
    pub fn value(&self) -> Option<Value> {
        match self {
            ExecutionResult::Value(v) => Some(*v),
            _ => None,
        }
    }
}

const CALL_TRAPPED: &str = "trapped call";
const ARG_BUFFER: usize = 8;

// ---------------- Interpreter macros ----------------
macro_rules! pop {
    ($stack:expr) => {
        $stack.pop().unwrap()
    };
}

macro_rules! unop {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let a = pop!($stack).$as();
        $stack.push(Value::$from(($f)(a)));
    }};
}

macro_rules! binop {
    ($stack:expr, $as:ident, $from:ident, $f:expr) => {{
        let b = pop!($stack).$as();
        let a = pop!($stack).$as();
        $stack.push(Value::$from(($f)(a, b)));
    }};
}

macro_rules! cmpop {
    ($stack:expr, $as:ident, $f:expr) => {{
        let b = pop!($stack).$as();
        let a = pop!($stack).$as();
        $stack.push(Value::from_u32(($f)(a, b) as u32));
    }};
}

macro_rules! mem_load {
    ($inst:expr, $stack:expr, $bytes:expr, $pc:expr, $method:ident, $conv:expr) => {{
        let offset = memarg($bytes, &mut $pc);
        let base = pop!($stack).as_u32();
        let v = $inst.memory.as_ref().unwrap().borrow().$method(base, offset)?;
        $stack.push(($conv)(v));
    }};
}

macro_rules! mem_store {
    ($inst:expr, $stack:expr, $bytes:expr, $pc:expr, $method:ident, $conv:expr) => {{
        let offset = memarg($bytes, &mut $pc);
        let v = ($conv)(pop!($stack));
        let base = pop!($stack).as_u32();
        $inst
            .memory
            .as_ref()
            .unwrap()
            .borrow_mut()
            .$method(base, offset, v)?;
    }};
}

macro_rules! take_branch {
    ($stack:expr, $pc:expr, $target:expr) => {{
        let t = $target;
        if t.carries_value {
            let v = *$stack.last().unwrap();
            $stack.truncate(t.drop_height as usize);
            $stack.push(v);
        } else {
            $stack.truncate(t.drop_height as usize);
        }
        $pc = t.dest_pc;
    }};
}

/// Execute a function of an instance.
///
/// `func_idx` must be in range and `args` must match the function's input
/// arity; both are debug-asserted only, per the embedding contract.
pub fn execute(instance: &Instance, func_idx: FuncIdx, args: &[Value], depth: u32) -> ExecutionResult {
    if depth >= CALL_STACK_LIMIT {
        debug_println!("execute: {}", STACK_EXHAUSTED);
        return ExecutionResult::Trapped;
    }
    debug_assert!((func_idx as usize) < instance.module.functions.len());
    debug_assert_eq!(
        args.len(),
        instance.module.get_function_type(func_idx).inputs.len()
    );

    if (func_idx as usize) < instance.imported_functions.len() {
        let f = &instance.imported_functions[func_idx as usize];
        return (f.func)(instance, args, depth);
    }

    match run_body(instance, func_idx, args, depth) {
        Ok(Some(v)) => ExecutionResult::Value(v),
        Ok(None) => ExecutionResult::Void,
        Err(msg) => {
            debug_println!("trap: {}", msg);
            ExecutionResult::Trapped
        }
    }
}

#[allow(clippy::cognitive_complexity)]
fn run_body(
    instance: &Instance,
    func_idx: FuncIdx,
    args: &[Value],
    depth: u32,
) -> Result<Option<Value>, &'static str> {
    let module = &instance.module;
    let func = &module.functions[func_idx as usize];
    let has_result = module.types[func.type_idx as usize].output.is_some();

    let mut locals: Vec<Value> = Vec::with_capacity(func.locals.len());
    locals.extend_from_slice(args);
    locals.resize(func.locals.len(), Value::default());

    let mut stack: Vec<Value> = Vec::with_capacity(func.max_stack as usize);
    let bytes: &[u8] = &module.bytes;
    let mut pc = func.body.start;
    let end = func.body.end;

    while pc < end {
        let op = bytes[pc];
        pc += 1;
        match op {
            // ---------------- Control ----------------
            0x00 => return Err(UNREACHABLE),
            0x01 => {}
            // block/loop only skip their block type; jumps are preprocessed
            0x02 | 0x03 => pc += 1,
            0x04 => {
                let false_dest = module.if_jumps[&(pc - 1)];
                let cond = pop!(stack).as_u32();
                if cond != 0 {
                    pc += 1;
                } else {
                    pc = false_dest;
                }
            }
            // falling into else means the true branch is done
            0x05 => pc = module.else_jumps[&(pc - 1)],
            0x0b => {}
            0x0c => take_branch!(stack, pc, module.branch_targets[&(pc - 1)]),
            0x0d => {
                let key = pc - 1;
                let cond = pop!(stack).as_u32();
                if cond != 0 {
                    take_branch!(stack, pc, module.branch_targets[&key]);
                } else {
                    let _ = leb_u32(bytes, &mut pc);
                }
            }
            0x0e => {
                let key = pc - 1;
                let i = pop!(stack).as_u32();
                let bt = &module.branch_tables[&key];
                let t = *bt.targets.get(i as usize).unwrap_or(&bt.default_target);
                take_branch!(stack, pc, t);
            }
            0x0f => break,
            0x10 => {
                let idx: u32 = leb_u32(bytes, &mut pc);
                let n = module.get_function_type(idx).inputs.len();
                let mut small = [Value::default(); ARG_BUFFER];
                let mut large = Vec::new();
                let call_args = pop_call_args(&mut stack, n, &mut small, &mut large);
                let res = execute(instance, idx, call_args, depth + 1);
                finish_call(&mut stack, res)?;
            }
            0x11 => {
                let type_idx = leb_u32(bytes, &mut pc) as usize;
                pc += 1; // reserved zero flag
                let i = pop!(stack).as_u32();
                // Clone the callable out before calling: the callee may
                // mutate the table
                let entry = {
                    let table = instance.table.as_ref().unwrap().borrow();
                    match table.get(i) {
                        None => return Err(UNDEF_ELEM),
                        Some(None) => return Err(UNINITIALIZED_ELEM),
                        Some(Some(f)) => f.clone(),
                    }
                };
                if entry.ty != module.types[type_idx] {
                    return Err(INDIRECT_CALL_MISMATCH);
                }
                let n = entry.ty.inputs.len();
                let mut small = [Value::default(); ARG_BUFFER];
                let mut large = Vec::new();
                let call_args = pop_call_args(&mut stack, n, &mut small, &mut large);
                let res = (entry.func)(instance, call_args, depth + 1);
                finish_call(&mut stack, res)?;
            }

            // ---------------- Parametric ----------------
            0x1a => {
                pop!(stack);
            }
            0x1b => {
                let cond = pop!(stack).as_u32();
                let b = pop!(stack);
                let a = pop!(stack);
                stack.push(if cond != 0 { a } else { b });
            }

            // ---------------- Variables ----------------
            0x20 => {
                let i = leb_u32(bytes, &mut pc);
                stack.push(locals[i as usize]);
            }
            0x21 => {
                let i = leb_u32(bytes, &mut pc);
                locals[i as usize] = pop!(stack);
            }
            0x22 => {
                let i = leb_u32(bytes, &mut pc);
                locals[i as usize] = *stack.last().unwrap();
            }
            0x23 => {
                let i = leb_u32(bytes, &mut pc);
                stack.push(instance.global_value(i as usize));
            }
            0x24 => {
                let i = leb_u32(bytes, &mut pc);
                instance.set_global_value(i as usize, pop!(stack));
            }

            // ---------------- Memory ----------------
            0x28 => mem_load!(instance, stack, bytes, pc, load_u32, Value::from_u32),
            0x29 => mem_load!(instance, stack, bytes, pc, load_u64, Value::from_u64),
            0x2a => mem_load!(instance, stack, bytes, pc, load_f32, Value::from_f32),
            0x2b => mem_load!(instance, stack, bytes, pc, load_f64, Value::from_f64),
            0x2c => mem_load!(instance, stack, bytes, pc, load_i8, |v: i8| Value::from_i32(v as i32)),
            0x2d => mem_load!(instance, stack, bytes, pc, load_u8, |v: u8| Value::from_u32(v as u32)),
            0x2e => mem_load!(instance, stack, bytes, pc, load_i16, |v: i16| Value::from_i32(v as i32)),
            0x2f => mem_load!(instance, stack, bytes, pc, load_u16, |v: u16| Value::from_u32(v as u32)),
            0x30 => mem_load!(instance, stack, bytes, pc, load_i8, |v: i8| Value::from_i64(v as i64)),
            0x31 => mem_load!(instance, stack, bytes, pc, load_u8, |v: u8| Value::from_u64(v as u64)),
            0x32 => mem_load!(instance, stack, bytes, pc, load_i16, |v: i16| Value::from_i64(v as i64)),
            0x33 => mem_load!(instance, stack, bytes, pc, load_u16, |v: u16| Value::from_u64(v as u64)),
            0x34 => mem_load!(instance, stack, bytes, pc, load_i32, |v: i32| Value::from_i64(v as i64)),
            0x35 => mem_load!(instance, stack, bytes, pc, load_u32, |v: u32| Value::from_u64(v as u64)),
            0x36 => mem_store!(instance, stack, bytes, pc, store_u32, |v: Value| v.as_u32()),
            0x37 => mem_store!(instance, stack, bytes, pc, store_u64, |v: Value| v.as_u64()),
            0x38 => mem_store!(instance, stack, bytes, pc, store_f32, |v: Value| v.as_f32()),
            0x39 => mem_store!(instance, stack, bytes, pc, store_f64, |v: Value| v.as_f64()),
            0x3a => mem_store!(instance, stack, bytes, pc, store_u8, |v: Value| v.as_u32() as u8),
            0x3b => mem_store!(instance, stack, bytes, pc, store_u16, |v: Value| v.as_u32() as u16),
            0x3c => mem_store!(instance, stack, bytes, pc, store_u8, |v: Value| v.as_u64() as u8),
            0x3d => mem_store!(instance, stack, bytes, pc, store_u16, |v: Value| v.as_u64() as u16),
            0x3e => mem_store!(instance, stack, bytes, pc, store_u32, |v: Value| v.as_u64() as u32),
            0x3f => {
                pc += 1; // reserved zero flag
                let size = instance.memory.as_ref().unwrap().borrow().size();
                stack.push(Value::from_u32(size));
            }
            0x40 => {
                pc += 1; // reserved zero flag
                let delta = pop!(stack).as_u32();
                let prev = instance.memory.as_ref().unwrap().borrow_mut().grow(delta);
                stack.push(Value::from_u32(prev));
            }

            // ---------------- Constants ----------------
            0x41 => {
                let v = sleb_i32(bytes, &mut pc);
                stack.push(Value::from_i32(v));
            }
            0x42 => {
                let v = sleb_i64(bytes, &mut pc);
                stack.push(Value::from_i64(v));
            }
            0x43 => {
                let bits = u32::from_le_bytes(bytes[pc..pc + 4].try_into().unwrap());
                pc += 4;
                stack.push(Value::from_f32_bits(bits));
            }
            0x44 => {
                let bits = u64::from_le_bytes(bytes[pc..pc + 8].try_into().unwrap());
                pc += 8;
                stack.push(Value::from_f64_bits(bits));
            }

            // ---------------- i32 comparisons ----------------
            0x45 => unop!(stack, as_u32, from_u32, |a: u32| (a == 0) as u32),
            0x46 => cmpop!(stack, as_u32, |a, b| a == b),
            0x47 => cmpop!(stack, as_u32, |a, b| a != b),
            0x48 => cmpop!(stack, as_i32, |a, b| a < b),
            0x49 => cmpop!(stack, as_u32, |a, b| a < b),
            0x4a => cmpop!(stack, as_i32, |a, b| a > b),
            0x4b => cmpop!(stack, as_u32, |a, b| a > b),
            0x4c => cmpop!(stack, as_i32, |a, b| a <= b),
            0x4d => cmpop!(stack, as_u32, |a, b| a <= b),
            0x4e => cmpop!(stack, as_i32, |a, b| a >= b),
            0x4f => cmpop!(stack, as_u32, |a, b| a >= b),

            // ---------------- i64 comparisons ----------------
            0x50 => {
                let a = pop!(stack).as_u64();
                stack.push(Value::from_u32((a == 0) as u32));
            }
            0x51 => cmpop!(stack, as_u64, |a, b| a == b),
            0x52 => cmpop!(stack, as_u64, |a, b| a != b),
            0x53 => cmpop!(stack, as_i64, |a, b| a < b),
            0x54 => cmpop!(stack, as_u64, |a, b| a < b),
            0x55 => cmpop!(stack, as_i64, |a, b| a > b),
            0x56 => cmpop!(stack, as_u64, |a, b| a > b),
            0x57 => cmpop!(stack, as_i64, |a, b| a <= b),
            0x58 => cmpop!(stack, as_u64, |a, b| a <= b),
            0x59 => cmpop!(stack, as_i64, |a, b| a >= b),
            0x5a => cmpop!(stack, as_u64, |a, b| a >= b),

            // ---------------- float comparisons ----------------
            0x5b => cmpop!(stack, as_f32, |a, b| a == b),
            0x5c => cmpop!(stack, as_f32, |a, b| a != b),
            0x5d => cmpop!(stack, as_f32, |a, b| a < b),
            0x5e => cmpop!(stack, as_f32, |a, b| a > b),
            0x5f => cmpop!(stack, as_f32, |a, b| a <= b),
            0x60 => cmpop!(stack, as_f32, |a, b| a >= b),
            0x61 => cmpop!(stack, as_f64, |a, b| a == b),
            0x62 => cmpop!(stack, as_f64, |a, b| a != b),
            0x63 => cmpop!(stack, as_f64, |a, b| a < b),
            0x64 => cmpop!(stack, as_f64, |a, b| a > b),
            0x65 => cmpop!(stack, as_f64, |a, b| a <= b),
            0x66 => cmpop!(stack, as_f64, |a, b| a >= b),

            // ---------------- i32 arithmetic ----------------
            0x67 => unop!(stack, as_u32, from_u32, |a: u32| a.leading_zeros()),
            0x68 => unop!(stack, as_u32, from_u32, |a: u32| a.trailing_zeros()),
            0x69 => unop!(stack, as_u32, from_u32, |a: u32| a.count_ones()),
            0x6a => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_add(b)),
            0x6b => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_sub(b)),
            0x6c => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_mul(b)),
            0x6d => {
                let b = pop!(stack).as_i32();
                let a = pop!(stack).as_i32();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                if a == i32::MIN && b == -1 {
                    return Err(INTEGER_OVERFLOW);
                }
                stack.push(Value::from_i32(a.wrapping_div(b)));
            }
            0x6e => {
                let b = pop!(stack).as_u32();
                let a = pop!(stack).as_u32();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_u32(a / b));
            }
            0x6f => {
                let b = pop!(stack).as_i32();
                let a = pop!(stack).as_i32();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_i32(a.wrapping_rem(b)));
            }
            0x70 => {
                let b = pop!(stack).as_u32();
                let a = pop!(stack).as_u32();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_u32(a % b));
            }
            0x71 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a & b),
            0x72 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a | b),
            0x73 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a ^ b),
            0x74 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_shl(b)),
            0x75 => binop!(stack, as_i32, from_i32, |a: i32, b: i32| a.wrapping_shr(b as u32)),
            0x76 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.wrapping_shr(b)),
            0x77 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.rotate_left(b & 31)),
            0x78 => binop!(stack, as_u32, from_u32, |a: u32, b: u32| a.rotate_right(b & 31)),

            // ---------------- i64 arithmetic ----------------
            0x79 => unop!(stack, as_u64, from_u64, |a: u64| a.leading_zeros() as u64),
            0x7a => unop!(stack, as_u64, from_u64, |a: u64| a.trailing_zeros() as u64),
            0x7b => unop!(stack, as_u64, from_u64, |a: u64| a.count_ones() as u64),
            0x7c => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_add(b)),
            0x7d => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_sub(b)),
            0x7e => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_mul(b)),
            0x7f => {
                let b = pop!(stack).as_i64();
                let a = pop!(stack).as_i64();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                if a == i64::MIN && b == -1 {
                    return Err(INTEGER_OVERFLOW);
                }
                stack.push(Value::from_i64(a.wrapping_div(b)));
            }
            0x80 => {
                let b = pop!(stack).as_u64();
                let a = pop!(stack).as_u64();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_u64(a / b));
            }
            0x81 => {
                let b = pop!(stack).as_i64();
                let a = pop!(stack).as_i64();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_i64(a.wrapping_rem(b)));
            }
            0x82 => {
                let b = pop!(stack).as_u64();
                let a = pop!(stack).as_u64();
                if b == 0 {
                    return Err(DIVIDE_BY_ZERO);
                }
                stack.push(Value::from_u64(a % b));
            }
            0x83 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a & b),
            0x84 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a | b),
            0x85 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a ^ b),
            0x86 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_shl(b as u32)),
            0x87 => binop!(stack, as_i64, from_i64, |a: i64, b: i64| a.wrapping_shr(b as u32)),
            0x88 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.wrapping_shr(b as u32)),
            0x89 => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.rotate_left((b & 63) as u32)),
            0x8a => binop!(stack, as_u64, from_u64, |a: u64, b: u64| a.rotate_right((b & 63) as u32)),

            // ---------------- f32 arithmetic ----------------
            0x8b => unop!(stack, as_f32, from_f32, |a: f32| a.abs()),
            0x8c => unop!(stack, as_f32, from_f32, |a: f32| -a),
            0x8d => unop!(stack, as_f32, from_f32, |a: f32| a.ceil()),
            0x8e => unop!(stack, as_f32, from_f32, |a: f32| a.floor()),
            0x8f => unop!(stack, as_f32, from_f32, |a: f32| a.trunc()),
            0x90 => unop!(stack, as_f32, from_f32, |a: f32| a.round_ties_even()),
            0x91 => unop!(stack, as_f32, from_f32, |a: f32| a.sqrt()),
            0x92 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a + b),
            0x93 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a - b),
            0x94 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a * b),
            0x95 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a / b),
            0x96 => binop!(stack, as_f32, from_f32, fmin32),
            0x97 => binop!(stack, as_f32, from_f32, fmax32),
            0x98 => binop!(stack, as_f32, from_f32, |a: f32, b: f32| a.copysign(b)),

            // ---------------- f64 arithmetic ----------------
            0x99 => unop!(stack, as_f64, from_f64, |a: f64| a.abs()),
            0x9a => unop!(stack, as_f64, from_f64, |a: f64| -a),
            0x9b => unop!(stack, as_f64, from_f64, |a: f64| a.ceil()),
            0x9c => unop!(stack, as_f64, from_f64, |a: f64| a.floor()),
            0x9d => unop!(stack, as_f64, from_f64, |a: f64| a.trunc()),
            0x9e => unop!(stack, as_f64, from_f64, |a: f64| a.round_ties_even()),
            0x9f => unop!(stack, as_f64, from_f64, |a: f64| a.sqrt()),
            0xa0 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a + b),
            0xa1 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a - b),
            0xa2 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a * b),
            0xa3 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a / b),
            0xa4 => binop!(stack, as_f64, from_f64, fmin64),
            0xa5 => binop!(stack, as_f64, from_f64, fmax64),
            0xa6 => binop!(stack, as_f64, from_f64, |a: f64, b: f64| a.copysign(b)),

            // ---------------- Conversions ----------------
            0xa7 => unop!(stack, as_i64, from_i32, |a: i64| a as i32),
            0xa8 => {
                let x = pop!(stack).as_f32();
                stack.push(Value::from_i32(trunc_to_i32_s(x as f64)?));
            }
            0xa9 => {
                let x = pop!(stack).as_f32();
                stack.push(Value::from_u32(trunc_to_i32_u(x as f64)?));
            }
            0xaa => {
                let x = pop!(stack).as_f64();
                stack.push(Value::from_i32(trunc_to_i32_s(x)?));
            }
            0xab => {
                let x = pop!(stack).as_f64();
                stack.push(Value::from_u32(trunc_to_i32_u(x)?));
            }
            0xac => unop!(stack, as_i32, from_i64, |a: i32| a as i64),
            0xad => unop!(stack, as_u32, from_u64, |a: u32| a as u64),
            0xae => {
                let x = pop!(stack).as_f32();
                stack.push(Value::from_i64(trunc_to_i64_s(x as f64)?));
            }
            0xaf => {
                let x = pop!(stack).as_f32();
                stack.push(Value::from_u64(trunc_to_i64_u(x as f64)?));
            }
            0xb0 => {
                let x = pop!(stack).as_f64();
                stack.push(Value::from_i64(trunc_to_i64_s(x)?));
            }
            0xb1 => {
                let x = pop!(stack).as_f64();
                stack.push(Value::from_u64(trunc_to_i64_u(x)?));
            }
            0xb2 => unop!(stack, as_i32, from_f32, |a: i32| a as f32),
            0xb3 => unop!(stack, as_u32, from_f32, |a: u32| a as f32),
            0xb4 => unop!(stack, as_i64, from_f32, |a: i64| a as f32),
            0xb5 => unop!(stack, as_u64, from_f32, |a: u64| a as f32),
            0xb6 => unop!(stack, as_f64, from_f32, |a: f64| a as f32),
            0xb7 => unop!(stack, as_i32, from_f64, |a: i32| a as f64),
            0xb8 => unop!(stack, as_u32, from_f64, |a: u32| a as f64),
            0xb9 => unop!(stack, as_i64, from_f64, |a: i64| a as f64),
            0xba => unop!(stack, as_u64, from_f64, |a: u64| a as f64),
            0xbb => unop!(stack, as_f32, from_f64, |a: f32| a as f64),
            0xbc => unop!(stack, as_f32_bits, from_u32, |a: u32| a),
            0xbd => unop!(stack, as_f64_bits, from_u64, |a: u64| a),
            0xbe => unop!(stack, as_u32, from_f32_bits, |a: u32| a),
            0xbf => unop!(stack, as_u64, from_f64_bits, |a: u64| a),

            _ => unreachable!(),
        }
    }

    Ok(if has_result { Some(pop!(stack)) } else { None })
}

// ---------------- Call plumbing ----------------
fn pop_call_args<'a>(
    stack: &mut Vec<Value>,
    n: usize,
    small: &'a mut [Value; ARG_BUFFER],
    large: &'a mut Vec<Value>,
) -> &'a [Value] {
    let split = stack.len() - n;
    let args: &'a [Value] = if n <= ARG_BUFFER {
        small[..n].copy_from_slice(&stack[split..]);
        &small[..n]
    } else {
        large.extend_from_slice(&stack[split..]);
        &large[..]
    };
    stack.truncate(split);
    args
}

fn finish_call(stack: &mut Vec<Value>, result: ExecutionResult) -> Result<(), &'static str> {
    match result {
        ExecutionResult::Trapped => Err(CALL_TRAPPED),
        ExecutionResult::Void => Ok(()),
        ExecutionResult::Value(v) => {
            stack.push(v);
            Ok(())
        }
    }
}

// ---------------- Runtime immediates ----------------
// Validated streams only; these cannot run off the buffer mid-function.
#[inline(always)]
fn leb_u32(bytes: &[u8], pc: &mut usize) -> u32 {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        let byte = bytes[*pc];
        *pc += 1;
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return result;
        }
        shift += 7;
    }
}

#[inline(always)]
fn sleb_i32(bytes: &[u8], pc: &mut usize) -> i32 {
    sleb_i64(bytes, pc) as i32
}

#[inline(always)]
fn sleb_i64(bytes: &[u8], pc: &mut usize) -> i64 {
    let mut result = 0i64;
    let mut shift = 0;
    let mut byte;
    loop {
        byte = bytes[*pc];
        *pc += 1;
        if shift < 63 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = (shift + 7).min(63);
        if byte & 0x80 == 0 {
            break;
        }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64).checked_shl(shift).unwrap_or(!0i64);
    }
    result
}

#[inline(always)]
fn memarg(bytes: &[u8], pc: &mut usize) -> u32 {
    let _align = leb_u32(bytes, pc);
    leb_u32(bytes, pc)
}

// ---------------- Float helpers ----------------
// Wasm min/max: NaN operands produce NaN, equal magnitudes order by sign so
// min(-0, +0) is -0 and max(-0, +0) is +0.
#[inline]
fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    if a < b {
        a
    } else {
        b
    }
}

#[inline]
fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == b {
        return if a.is_sign_positive() { a } else { b };
    }
    if a > b {
        a
    } else {
        b
    }
}

#[inline]
fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_negative() { a } else { b };
    }
    if a < b {
        a
    } else {
        b
    }
}

#[inline]
fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        return f64::NAN;
    }
    if a == b {
        return if a.is_sign_positive() { a } else { b };
    }
    if a > b {
        a
    } else {
        b
    }
}

// Truncating float-to-int conversions trap on NaN and out-of-range inputs.
// f32 sources are widened to f64 first so the range checks stay exact.
#[inline]
fn trunc_to_i32_s(x: f64) -> Result<i32, &'static str> {
    if x.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = x.trunc();
    if !(-2147483648.0..=2147483647.0).contains(&t) {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as i32)
}

#[inline]
fn trunc_to_i32_u(x: f64) -> Result<u32, &'static str> {
    if x.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = x.trunc();
    if !(0.0..=4294967295.0).contains(&t) {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as u32)
}

#[inline]
fn trunc_to_i64_s(x: f64) -> Result<i64, &'static str> {
    if x.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = x.trunc();
    if t < -9223372036854775808.0 || t >= 9223372036854775808.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as i64)
}

#[inline]
fn trunc_to_i64_u(x: f64) -> Result<u64, &'static str> {
    if x.is_nan() {
        return Err(INVALID_CONV_TO_INT);
    }
    let t = x.trunc();
    if t < 0.0 || t >= 18446744073709551616.0 {
        return Err(INTEGER_OVERFLOW);
    }
    Ok(t as u64)
}
