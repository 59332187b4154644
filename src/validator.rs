use crate::byte_iter::ByteIter;
use crate::error::Error::{Malformed, Validation};
use crate::error::*;
use crate::leb128::*;
use crate::module::*;
use crate::types::*;

// ---------------- Control flow bookkeeping ----------------
#[derive(Clone)]
pub enum FrameKind {
    Function,
    Block,
    Loop { body_pc: usize },
    If { opcode_pc: usize },
    IfElse { opcode_pc: usize, else_pc: usize },
}

/// A branch recorded before its destination is known. Plain `br`/`br_if`
/// sites, or one slot of a `br_table`.
#[derive(Clone, Copy)]
enum Fixup {
    Branch(usize),
    Table { pc: usize, slot: usize },
}

#[derive(Clone)]
pub struct ControlFrame {
    result: Option<ValType>,
    height: usize,
    unreachable: bool,
    kind: FrameKind,
    pending: Vec<Fixup>,
}

pub enum Action {
    Continue,
    End,
}

// ---------------- Type stack ----------------
pub struct ValidatorStack {
    val_stack: Vec<ValType>,
    ctrl_stack: Vec<ControlFrame>,
    max_height: usize,
}

impl ValidatorStack {
    pub fn new() -> Self {
        Self {
            val_stack: Vec::with_capacity(1024),
            ctrl_stack: Vec::with_capacity(64),
            max_height: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.val_stack.len()
    }
    pub fn max_height(&self) -> usize {
        self.max_height
    }
    pub fn frame_count(&self) -> usize {
        self.ctrl_stack.len()
    }
    pub fn last_frame(&self) -> Option<&ControlFrame> {
        self.ctrl_stack.last()
    }
    pub fn get_frame(&self, index: usize) -> Option<&ControlFrame> {
        self.ctrl_stack.get(index)
    }
    fn pop_frame(&mut self) -> Option<ControlFrame> {
        self.ctrl_stack.pop()
    }

    pub fn push_val(&mut self, ty: ValType) {
        self.val_stack.push(ty);
        self.max_height = self.max_height.max(self.val_stack.len());
    }

    pub fn pop_val(&mut self) -> Result<ValType, Error> {
        if self.ctrl_stack.is_empty() {
            return Err(Validation(TYPE_MISMATCH));
        }
        let frame = self.ctrl_stack.last().unwrap();

        if self.val_stack.len() == frame.height {
            if frame.unreachable {
                return Ok(ValType::Any);
            }
            return Err(Validation(TYPE_MISMATCH));
        }
        if self.val_stack.len() < frame.height {
            return Err(Validation(TYPE_MISMATCH));
        }
        Ok(self.val_stack.pop().unwrap())
    }

    pub fn pop_val_expect(&mut self, expect: ValType) -> Result<ValType, Error> {
        let actual = self.pop_val()?;
        if actual == ValType::Any {
            return Ok(expect);
        }
        if expect == ValType::Any {
            return Ok(actual);
        }
        if actual != expect {
            return Err(Validation(TYPE_MISMATCH));
        }
        Ok(actual)
    }

    pub fn pop_vals(&mut self, types: &[ValType]) -> Result<(), Error> {
        for &ty in types.iter().rev() {
            self.pop_val_expect(ty)?;
        }
        Ok(())
    }

    fn push_frame(&mut self, frame: ControlFrame) {
        self.ctrl_stack.push(frame);
    }

    pub fn push_ctrl(&mut self, result: Option<ValType>, kind: FrameKind) {
        self.ctrl_stack.push(ControlFrame {
            result,
            height: self.val_stack.len(),
            unreachable: false,
            kind,
            pending: Vec::new(),
        });
    }

    pub fn unreachable(&mut self) {
        if let Some(frame) = self.ctrl_stack.last_mut() {
            self.val_stack.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    /// Record a branch from `opcode_pc` to the frame at `target_idx`. Loop
    /// destinations are known immediately; everything else waits for the
    /// frame's `end`.
    fn register_branch(&mut self, m: &mut Module, opcode_pc: usize, target_idx: usize) {
        let frame = &mut self.ctrl_stack[target_idx];
        match frame.kind {
            FrameKind::Loop { body_pc } => {
                m.branch_targets.insert(
                    opcode_pc,
                    BranchTarget {
                        dest_pc: body_pc,
                        drop_height: frame.height as u32,
                        carries_value: false,
                    },
                );
            }
            _ => frame.pending.push(Fixup::Branch(opcode_pc)),
        }
    }

    fn register_table_branch(
        &mut self,
        m: &mut Module,
        table_pc: usize,
        slot: usize,
        target_idx: usize,
    ) {
        let frame = &mut self.ctrl_stack[target_idx];
        match frame.kind {
            FrameKind::Loop { body_pc } => {
                let bt = BranchTarget {
                    dest_pc: body_pc,
                    drop_height: frame.height as u32,
                    carries_value: false,
                };
                fill_table_slot(m, table_pc, slot, bt);
            }
            _ => frame.pending.push(Fixup::Table { pc: table_pc, slot }),
        }
    }
}

fn fill_table_slot(m: &mut Module, table_pc: usize, slot: usize, bt: BranchTarget) {
    let table = m.branch_tables.get_mut(&table_pc).unwrap();
    if slot < table.targets.len() {
        table.targets[slot] = bt;
    } else {
        table.default_target = bt;
    }
}

fn resolve_fixups(m: &mut Module, frame: &ControlFrame, end_pc: usize) {
    let bt = BranchTarget {
        dest_pc: end_pc,
        drop_height: frame.height as u32,
        carries_value: frame.result.is_some(),
    };
    for fix in &frame.pending {
        match *fix {
            Fixup::Branch(pc) => {
                m.branch_targets.insert(pc, bt);
            }
            Fixup::Table { pc, slot } => fill_table_slot(m, pc, slot, bt),
        }
    }
}

/// The result a branch to this label carries: loops take none (their label
/// is the loop start), everything else takes the frame result.
fn label_result(frame: &ControlFrame) -> Option<ValType> {
    match frame.kind {
        FrameKind::Loop { .. } => None,
        _ => frame.result,
    }
}

// ---------------- Constant expression validation ----------------
pub fn validate_const(
    bytes: &[u8],
    it: &mut ByteIter,
    expected: ValType,
    globals: &[Global],
) -> Result<(), Error> {
    let mut stack: Vec<ValType> = Vec::new();
    loop {
        let byte = it.read_u8()?;
        if byte == 0x0b {
            // end
            break;
        }
        match byte {
            0x23 => {
                // global.get of an imported immutable global
                let global_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                let g = globals.get(global_idx as usize);
                match g {
                    Some(g) if g.imported => {
                        if g.ty.mutable {
                            return Err(Validation(CONST_EXP_REQUIRED));
                        }
                        stack.push(g.ty.value_type);
                    }
                    _ => return Err(Validation(UNKNOWN_GLOBAL)),
                }
            }
            0x41 => {
                let _val: i32 = safe_read_sleb128(bytes, &mut it.idx, 32)?;
                stack.push(ValType::I32);
            }
            0x42 => {
                let _val: i64 = safe_read_sleb128(bytes, &mut it.idx, 64)?;
                stack.push(ValType::I64);
            }
            0x43 => {
                if !it.has_n_left(4) {
                    return Err(Malformed(UNEXPECTED_END));
                }
                it.advance(4);
                stack.push(ValType::F32);
            }
            0x44 => {
                if !it.has_n_left(8) {
                    return Err(Malformed(UNEXPECTED_END));
                }
                it.advance(8);
                stack.push(ValType::F64);
            }
            other => {
                // A real instruction outside the constant subset is a
                // validation failure; an unassigned byte is malformed
                let known = get_validators()[other as usize] as usize != validate_missing as usize;
                return if known {
                    Err(Validation(CONST_EXP_REQUIRED))
                } else {
                    Err(Malformed(ILLEGAL_OP))
                };
            }
        }
    }

    if !(stack.len() == 1 && stack[0] == expected) {
        return Err(Validation(TYPE_MISMATCH));
    }
    Ok(())
}

// ---------------- Function validation & preprocessing ----------------
pub struct Validator<'a> {
    module: &'a mut Module,
}

impl<'a> Validator<'a> {
    pub fn new(module: &'a mut Module) -> Self {
        Self { module }
    }

    /// Type-check one function body and fill the module's jump side tables
    /// and the function's operand-stack high-water mark.
    pub fn validate_function(&mut self, func_idx: usize) -> Result<(), Error> {
        let func = self.module.functions[func_idx].clone();
        let bytes_rc = self.module.bytes.clone();
        let mut it = ByteIter::new(&bytes_rc, func.body.start);
        let mut vs = ValidatorStack::new();

        vs.push_frame(ControlFrame {
            result: self.module.types[func.type_idx as usize].output,
            height: 0,
            unreachable: false,
            kind: FrameKind::Function,
            pending: Vec::new(),
        });

        loop {
            if it.cur() >= func.body.end {
                return Err(Malformed(END_EXPECTED));
            }
            let opcode = it.read_u8()?;
            match get_validators()[opcode as usize](self.module, &mut it, &func, &mut vs) {
                Ok(Action::Continue) => continue,
                Ok(Action::End) => break,
                Err(e) => return Err(e),
            }
        }

        if it.cur() != func.body.end {
            return Err(Malformed(SECTION_SIZE_MISMATCH));
        }
        self.module.functions[func_idx].max_stack = vs.max_height() as u32;
        Ok(())
    }
}

type ValidatorFn = fn(&mut Module, &mut ByteIter, &Function, &mut ValidatorStack) -> Result<Action, Error>;

fn validate_missing(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    _: &mut ValidatorStack,
) -> Result<Action, Error> {
    Err(Malformed(UNKNOWN_INSTRUCTION))
}

// ---------------- Control flow ----------------
fn validate_unreachable(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    vs.unreachable();
    Ok(Action::Continue)
}

fn validate_nop(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    _: &mut ValidatorStack,
) -> Result<Action, Error> {
    Ok(Action::Continue)
}

fn validate_block(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let result = read_block_type(it.bytes, &mut it.idx)?;
    vs.push_ctrl(result, FrameKind::Block);
    Ok(Action::Continue)
}

fn validate_loop(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let result = read_block_type(it.bytes, &mut it.idx)?;
    let body_pc = it.cur();
    vs.push_ctrl(result, FrameKind::Loop { body_pc });
    Ok(Action::Continue)
}

fn validate_if(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let opcode_pc = it.cur() - 1;
    let result = read_block_type(it.bytes, &mut it.idx)?;
    vs.pop_val_expect(ValType::I32)?;
    vs.push_ctrl(result, FrameKind::If { opcode_pc });
    Ok(Action::Continue)
}

fn validate_else(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    match vs.last_frame().map(|f| &f.kind) {
        Some(FrameKind::If { .. }) => {}
        _ => return Err(Validation(ELSE_MUST_CLOSE_IF)),
    }

    if let Some(result) = vs.last_frame().unwrap().result {
        vs.pop_val_expect(result)?;
    }
    let frame = vs.pop_frame().unwrap();
    if vs.size() != frame.height {
        return Err(Validation(TYPE_MISMATCH));
    }

    let opcode_pc = match frame.kind {
        FrameKind::If { opcode_pc } => opcode_pc,
        _ => unreachable!(),
    };
    let else_pc = it.cur();

    // Same frame, false branch; branches recorded inside the true branch
    // still resolve at the shared end
    vs.push_frame(ControlFrame {
        result: frame.result,
        height: frame.height,
        unreachable: false,
        kind: FrameKind::IfElse { opcode_pc, else_pc },
        pending: frame.pending,
    });
    Ok(Action::Continue)
}

fn validate_end(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let end_pc = it.cur() - 1;

    if vs.frame_count() == 1 {
        // Function frame: the result must be on the stack and nothing else
        if let Some(result) = vs.last_frame().unwrap().result {
            vs.pop_val_expect(result)?;
        }
        if vs.size() != 0 {
            return Err(Validation(TYPE_MISMATCH));
        }
        let frame = vs.pop_frame().unwrap();
        resolve_fixups(m, &frame, end_pc);
        return Ok(Action::End);
    }

    if let Some(result) = vs.last_frame().unwrap().result {
        vs.pop_val_expect(result)?;
    }
    let frame = vs.pop_frame().unwrap();
    if vs.size() != frame.height {
        return Err(Validation(TYPE_MISMATCH));
    }

    match frame.kind {
        FrameKind::If { opcode_pc } => {
            // An if without else cannot produce a value
            if frame.result.is_some() {
                return Err(Validation(TYPE_MISMATCH));
            }
            m.if_jumps.insert(opcode_pc, end_pc);
        }
        FrameKind::IfElse { opcode_pc, else_pc } => {
            m.if_jumps.insert(opcode_pc, else_pc);
            m.else_jumps.insert(else_pc - 1, end_pc);
        }
        _ => {}
    }
    resolve_fixups(m, &frame, end_pc);

    if let Some(result) = frame.result {
        vs.push_val(result);
    }
    Ok(Action::Continue)
}

fn validate_br(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let opcode_pc = it.cur() - 1;
    let depth: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (depth as usize) >= vs.frame_count() {
        return Err(Validation(UNKNOWN_LABEL));
    }
    let target_idx = vs.frame_count() - 1 - depth as usize;
    vs.register_branch(m, opcode_pc, target_idx);
    if let Some(result) = label_result(vs.get_frame(target_idx).unwrap()) {
        vs.pop_val_expect(result)?;
    }
    vs.unreachable();
    Ok(Action::Continue)
}

fn validate_br_if(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let opcode_pc = it.cur() - 1;
    let depth: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (depth as usize) >= vs.frame_count() {
        return Err(Validation(UNKNOWN_LABEL));
    }
    vs.pop_val_expect(ValType::I32)?;
    let target_idx = vs.frame_count() - 1 - depth as usize;
    vs.register_branch(m, opcode_pc, target_idx);
    // The carried value stays on the stack when the branch is not taken
    if let Some(result) = label_result(vs.get_frame(target_idx).unwrap()) {
        let popped = vs.pop_val_expect(result)?;
        vs.push_val(popped);
    }
    Ok(Action::Continue)
}

fn validate_br_table(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let opcode_pc = it.cur() - 1;
    vs.pop_val_expect(ValType::I32)?;

    // The count is attacker-controlled; let the label reads bound it before
    // any sizeable allocation happens
    let n_targets: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    let mut labels: Vec<u32> = Vec::new();
    for _ in 0..n_targets {
        let lab: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
        labels.push(lab);
    }
    let default_lab: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    labels.push(default_lab);

    for &lab in &labels {
        if (lab as usize) >= vs.frame_count() {
            return Err(Validation(UNKNOWN_LABEL));
        }
    }

    // Every target must agree with the default label's arity and type
    let default_idx = vs.frame_count() - 1 - default_lab as usize;
    let expected = label_result(vs.get_frame(default_idx).unwrap());
    for &lab in &labels {
        let target = vs.get_frame(vs.frame_count() - 1 - lab as usize).unwrap();
        if label_result(target) != expected {
            return Err(Validation(TYPE_MISMATCH));
        }
    }

    m.branch_tables.insert(
        opcode_pc,
        BranchTable {
            targets: vec![BranchTarget::default(); n_targets as usize],
            default_target: BranchTarget::default(),
        },
    );
    for (slot, &lab) in labels.iter().enumerate() {
        let target_idx = vs.frame_count() - 1 - lab as usize;
        vs.register_table_branch(m, opcode_pc, slot, target_idx);
    }

    if let Some(result) = expected {
        vs.pop_val_expect(result)?;
    }
    vs.unreachable();
    Ok(Action::Continue)
}

fn validate_return(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    // Return targets the function frame
    if let Some(result) = vs.get_frame(0).unwrap().result {
        vs.pop_val_expect(result)?;
    }
    vs.unreachable();
    Ok(Action::Continue)
}

// ---------------- Calls ----------------
fn validate_call(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let func_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (func_idx as usize) >= m.functions.len() {
        return Err(Validation(UNKNOWN_FUNC));
    }
    let ty = m.get_function_type(func_idx).clone();
    vs.pop_vals(&ty.inputs)?;
    if let Some(result) = ty.output {
        vs.push_val(result);
    }
    Ok(Action::Continue)
}

fn validate_call_indirect(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let type_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (type_idx as usize) >= m.types.len() {
        return Err(Validation(UNKNOWN_TYPE));
    }
    let flag = it.read_u8()?;
    if flag != 0 {
        return Err(Malformed(ZERO_FLAG_EXPECTED));
    }
    if m.table.is_none() {
        return Err(Validation(UNKNOWN_TABLE));
    }
    vs.pop_val_expect(ValType::I32)?;
    let ty = m.types[type_idx as usize].clone();
    vs.pop_vals(&ty.inputs)?;
    if let Some(result) = ty.output {
        vs.push_val(result);
    }
    Ok(Action::Continue)
}

// ---------------- Parametric ----------------
fn validate_drop(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    vs.pop_val()?;
    Ok(Action::Continue)
}

fn validate_select(
    _: &mut Module,
    _: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    vs.pop_val_expect(ValType::I32)?;
    let t1 = vs.pop_val()?;
    let t2 = vs.pop_val()?;
    if t1 != t2 && t1 != ValType::Any && t2 != ValType::Any {
        return Err(Validation(TYPE_MISMATCH));
    }
    vs.push_val(if t1 == ValType::Any { t2 } else { t1 });
    Ok(Action::Continue)
}

// ---------------- Variables ----------------
fn validate_local_get(
    _: &mut Module,
    it: &mut ByteIter,
    f: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let local_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (local_idx as usize) >= f.locals.len() {
        return Err(Validation(UNKNOWN_LOCAL));
    }
    vs.push_val(f.locals[local_idx as usize]);
    Ok(Action::Continue)
}

fn validate_local_set(
    _: &mut Module,
    it: &mut ByteIter,
    f: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let local_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (local_idx as usize) >= f.locals.len() {
        return Err(Validation(UNKNOWN_LOCAL));
    }
    vs.pop_val_expect(f.locals[local_idx as usize])?;
    Ok(Action::Continue)
}

fn validate_local_tee(
    _: &mut Module,
    it: &mut ByteIter,
    f: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let local_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (local_idx as usize) >= f.locals.len() {
        return Err(Validation(UNKNOWN_LOCAL));
    }
    let ty = f.locals[local_idx as usize];
    vs.pop_val_expect(ty)?;
    vs.push_val(ty);
    Ok(Action::Continue)
}

fn validate_global_get(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let global_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (global_idx as usize) >= m.globals.len() {
        return Err(Validation(UNKNOWN_GLOBAL));
    }
    vs.push_val(m.globals[global_idx as usize].ty.value_type);
    Ok(Action::Continue)
}

fn validate_global_set(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let global_idx: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (global_idx as usize) >= m.globals.len() {
        return Err(Validation(UNKNOWN_GLOBAL));
    }
    if !m.globals[global_idx as usize].ty.mutable {
        return Err(Validation(GLOBAL_IS_IMMUTABLE));
    }
    vs.pop_val_expect(m.globals[global_idx as usize].ty.value_type)?;
    Ok(Action::Continue)
}

// ---------------- Memory ----------------
macro_rules! assert_valid_memory {
    ($it:expr, $m:expr) => {
        let flag = $it.read_u8()?;
        if flag != 0 {
            return Err(Malformed(ZERO_FLAG_EXPECTED));
        } else if $m.memory.is_none() {
            return Err(Validation(UNKNOWN_MEMORY));
        }
    };
}

fn validate_memory_size(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    assert_valid_memory!(it, m);
    vs.push_val(ValType::I32);
    Ok(Action::Continue)
}

fn validate_memory_grow(
    m: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    assert_valid_memory!(it, m);
    vs.pop_val_expect(ValType::I32)?;
    vs.push_val(ValType::I32);
    Ok(Action::Continue)
}

fn validate_memarg(
    m: &Module,
    it: &mut ByteIter,
    natural_align: u32,
) -> Result<(), Error> {
    let align_bits: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if m.memory.is_none() {
        return Err(Validation(UNKNOWN_MEMORY));
    }
    if align_bits >= 32 {
        return Err(Malformed(INT_TOO_LARGE));
    }
    let _offset: u32 = safe_read_leb128(it.bytes, &mut it.idx, 32)?;
    if (1u64 << align_bits) > natural_align as u64 {
        return Err(Validation(ALIGNMENT_TOO_LARGE));
    }
    Ok(())
}

fn validate_load(
    m: &mut Module,
    it: &mut ByteIter,
    val_ty: ValType,
    natural_align: u32,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    validate_memarg(m, it, natural_align)?;
    vs.pop_val_expect(ValType::I32)?;
    vs.push_val(val_ty);
    Ok(Action::Continue)
}

fn validate_store(
    m: &mut Module,
    it: &mut ByteIter,
    val_ty: ValType,
    natural_align: u32,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    validate_memarg(m, it, natural_align)?;
    vs.pop_val_expect(val_ty)?;
    vs.pop_val_expect(ValType::I32)?;
    Ok(Action::Continue)
}

macro_rules! load {
    ($name:ident, $ty:expr, $align:expr) => {
        fn $name(
            m: &mut Module,
            it: &mut ByteIter,
            _: &Function,
            vs: &mut ValidatorStack,
        ) -> Result<Action, Error> {
            validate_load(m, it, $ty, $align, vs)
        }
    };
}

macro_rules! store {
    ($name:ident, $ty:expr, $align:expr) => {
        fn $name(
            m: &mut Module,
            it: &mut ByteIter,
            _: &Function,
            vs: &mut ValidatorStack,
        ) -> Result<Action, Error> {
            validate_store(m, it, $ty, $align, vs)
        }
    };
}

load!(validate_i32load, ValType::I32, 4); load!(validate_i64load, ValType::I64, 8);
load!(validate_f32load, ValType::F32, 4); load!(validate_f64load, ValType::F64, 8);
load!(validate_i32load8_s, ValType::I32, 1); load!(validate_i32load8_u, ValType::I32, 1);
load!(validate_i32load16_s, ValType::I32, 2); load!(validate_i32load16_u, ValType::I32, 2);
load!(validate_i64load8_s, ValType::I64, 1); load!(validate_i64load8_u, ValType::I64, 1);
load!(validate_i64load16_s, ValType::I64, 2); load!(validate_i64load16_u, ValType::I64, 2);
load!(validate_i64load32_s, ValType::I64, 4); load!(validate_i64load32_u, ValType::I64, 4);
store!(validate_i32store, ValType::I32, 4); store!(validate_i64store, ValType::I64, 8);
store!(validate_f32store, ValType::F32, 4); store!(validate_f64store, ValType::F64, 8);
store!(validate_i32store8, ValType::I32, 1); store!(validate_i32store16, ValType::I32, 2);
store!(validate_i64store8, ValType::I64, 1); store!(validate_i64store16, ValType::I64, 2);
store!(validate_i64store32, ValType::I64, 4);

// ---------------- Constants ----------------
fn validate_i32const(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let _val: i32 = safe_read_sleb128(it.bytes, &mut it.idx, 32)?;
    vs.push_val(ValType::I32);
    Ok(Action::Continue)
}

fn validate_i64const(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    let _val: i64 = safe_read_sleb128(it.bytes, &mut it.idx, 64)?;
    vs.push_val(ValType::I64);
    Ok(Action::Continue)
}

fn validate_f32const(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    if !it.has_n_left(4) {
        return Err(Malformed(UNEXPECTED_END));
    }
    it.advance(4);
    vs.push_val(ValType::F32);
    Ok(Action::Continue)
}

fn validate_f64const(
    _: &mut Module,
    it: &mut ByteIter,
    _: &Function,
    vs: &mut ValidatorStack,
) -> Result<Action, Error> {
    if !it.has_n_left(8) {
        return Err(Malformed(UNEXPECTED_END));
    }
    it.advance(8);
    vs.push_val(ValType::F64);
    Ok(Action::Continue)
}

// ---------------- Numerics ----------------
macro_rules! numeric {
    ($name:ident, $in:expr, $out:expr) => {
        fn $name(
            _: &mut Module,
            _: &mut ByteIter,
            _: &Function,
            vs: &mut ValidatorStack,
        ) -> Result<Action, Error> {
            vs.pop_vals($in)?;
            for &t in $out {
                vs.push_val(t);
            }
            Ok(Action::Continue)
        }
    };
}

numeric!(validate_i32_i32, &[ValType::I32], &[ValType::I32]);
numeric!(validate_i64_i64, &[ValType::I64], &[ValType::I64]);
numeric!(validate_f32_f32, &[ValType::F32], &[ValType::F32]);
numeric!(validate_f64_f64, &[ValType::F64], &[ValType::F64]);
numeric!(validate_i32i32_i32, &[ValType::I32, ValType::I32], &[ValType::I32]);
numeric!(validate_i64i64_i64, &[ValType::I64, ValType::I64], &[ValType::I64]);
numeric!(validate_f32f32_f32, &[ValType::F32, ValType::F32], &[ValType::F32]);
numeric!(validate_f64f64_f64, &[ValType::F64, ValType::F64], &[ValType::F64]);
numeric!(validate_i64_i32, &[ValType::I64], &[ValType::I32]);
numeric!(validate_f32_i32, &[ValType::F32], &[ValType::I32]);
numeric!(validate_f64_i32, &[ValType::F64], &[ValType::I32]);
numeric!(validate_i64i64_i32, &[ValType::I64, ValType::I64], &[ValType::I32]);
numeric!(validate_f32f32_i32, &[ValType::F32, ValType::F32], &[ValType::I32]);
numeric!(validate_f64f64_i32, &[ValType::F64, ValType::F64], &[ValType::I32]);
numeric!(validate_i32_i64, &[ValType::I32], &[ValType::I64]);
numeric!(validate_f32_i64, &[ValType::F32], &[ValType::I64]);
numeric!(validate_f64_i64, &[ValType::F64], &[ValType::I64]);
numeric!(validate_i32_f32, &[ValType::I32], &[ValType::F32]);
numeric!(validate_i64_f32, &[ValType::I64], &[ValType::F32]);
numeric!(validate_f64_f32, &[ValType::F64], &[ValType::F32]);
numeric!(validate_i32_f64, &[ValType::I32], &[ValType::F64]);
numeric!(validate_i64_f64, &[ValType::I64], &[ValType::F64]);
numeric!(validate_f32_f64, &[ValType::F32], &[ValType::F64]);

// ---------------- Dispatch table ----------------
#[allow(clippy::all)]
fn build_validators_table() -> [ValidatorFn; 256] {
    let mut t: [ValidatorFn; 256] = [validate_missing; 256];
    // Control flow
    t[0x00] = validate_unreachable; t[0x01] = validate_nop;
    t[0x02] = validate_block; t[0x03] = validate_loop;
    t[0x04] = validate_if; t[0x05] = validate_else;
    t[0x0b] = validate_end; t[0x0c] = validate_br;
    t[0x0d] = validate_br_if; t[0x0e] = validate_br_table;
    t[0x0f] = validate_return;
    // Calls
    t[0x10] = validate_call; t[0x11] = validate_call_indirect;
    // Parametric
    t[0x1a] = validate_drop; t[0x1b] = validate_select;
    // Variables
    t[0x20] = validate_local_get; t[0x21] = validate_local_set;
    t[0x22] = validate_local_tee; t[0x23] = validate_global_get;
    t[0x24] = validate_global_set;
    // Memory loads
    t[0x28] = validate_i32load; t[0x29] = validate_i64load;
    t[0x2a] = validate_f32load; t[0x2b] = validate_f64load;
    t[0x2c] = validate_i32load8_s; t[0x2d] = validate_i32load8_u;
    t[0x2e] = validate_i32load16_s; t[0x2f] = validate_i32load16_u;
    t[0x30] = validate_i64load8_s; t[0x31] = validate_i64load8_u;
    t[0x32] = validate_i64load16_s; t[0x33] = validate_i64load16_u;
    t[0x34] = validate_i64load32_s; t[0x35] = validate_i64load32_u;
    // Memory stores
    t[0x36] = validate_i32store; t[0x37] = validate_i64store;
    t[0x38] = validate_f32store; t[0x39] = validate_f64store;
    t[0x3a] = validate_i32store8; t[0x3b] = validate_i32store16;
    t[0x3c] = validate_i64store8; t[0x3d] = validate_i64store16;
    t[0x3e] = validate_i64store32;
    // Memory size/grow
    t[0x3f] = validate_memory_size; t[0x40] = validate_memory_grow;
    // Constants
    t[0x41] = validate_i32const; t[0x42] = validate_i64const;
    t[0x43] = validate_f32const; t[0x44] = validate_f64const;
    // Numerics
    t[0x45] = validate_i32_i32; // i32.eqz
    for i in 0x46..=0x4f { t[i] = validate_i32i32_i32; } // i32 comparisons
    t[0x50] = validate_i64_i32; // i64.eqz
    for i in 0x51..=0x5a { t[i] = validate_i64i64_i32; } // i64 comparisons
    for i in 0x5b..=0x60 { t[i] = validate_f32f32_i32; } // f32 comparisons
    for i in 0x61..=0x66 { t[i] = validate_f64f64_i32; } // f64 comparisons
    for i in 0x67..=0x69 { t[i] = validate_i32_i32; } // i32 unary
    for i in 0x6a..=0x78 { t[i] = validate_i32i32_i32; } // i32 binary
    for i in 0x79..=0x7b { t[i] = validate_i64_i64; } // i64 unary
    for i in 0x7c..=0x8a { t[i] = validate_i64i64_i64; } // i64 binary
    for i in 0x8b..=0x91 { t[i] = validate_f32_f32; } // f32 unary
    for i in 0x92..=0x98 { t[i] = validate_f32f32_f32; } // f32 binary
    for i in 0x99..=0x9f { t[i] = validate_f64_f64; } // f64 unary
    for i in 0xa0..=0xa6 { t[i] = validate_f64f64_f64; } // f64 binary
    // Conversions
    t[0xa7] = validate_i64_i32; // i32.wrap_i64
    t[0xa8] = validate_f32_i32; t[0xa9] = validate_f32_i32; // i32.trunc_f32
    t[0xaa] = validate_f64_i32; t[0xab] = validate_f64_i32; // i32.trunc_f64
    t[0xac] = validate_i32_i64; t[0xad] = validate_i32_i64; // i64.extend_i32
    t[0xae] = validate_f32_i64; t[0xaf] = validate_f32_i64; // i64.trunc_f32
    t[0xb0] = validate_f64_i64; t[0xb1] = validate_f64_i64; // i64.trunc_f64
    t[0xb2] = validate_i32_f32; t[0xb3] = validate_i32_f32; // f32.convert_i32
    t[0xb4] = validate_i64_f32; t[0xb5] = validate_i64_f32; // f32.convert_i64
    t[0xb6] = validate_f64_f32; // f32.demote_f64
    t[0xb7] = validate_i32_f64; t[0xb8] = validate_i32_f64; // f64.convert_i32
    t[0xb9] = validate_i64_f64; t[0xba] = validate_i64_f64; // f64.convert_i64
    t[0xbb] = validate_f32_f64; // f64.promote_f32
    t[0xbc] = validate_f32_i32; // i32.reinterpret_f32
    t[0xbd] = validate_f64_i64; // i64.reinterpret_f64
    t[0xbe] = validate_i32_f32; // f32.reinterpret_i32
    t[0xbf] = validate_i64_f64; // f64.reinterpret_i64
    t
}

fn get_validators() -> &'static [ValidatorFn; 256] {
    static VALIDATORS: std::sync::LazyLock<Box<[ValidatorFn; 256]>> =
        std::sync::LazyLock::new(|| Box::new(build_validators_table()));
    &VALIDATORS
}
