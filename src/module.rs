use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use crate::byte_iter::ByteIter;
use crate::error::Error::*;
use crate::error::*;
use crate::leb128::*;
use crate::types::*;
use crate::validator::{validate_const, Validator};

// ---------------- Imports and exports ----------------
#[derive(Clone, Debug)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Clone, Debug)]
pub enum ImportDesc {
    Func(TypeIdx),
    Table(Limits),
    Memory(Limits),
    Global(GlobalType),
}

#[derive(Clone, Debug)]
pub struct Export {
    pub kind: ExternKind,
    pub idx: u32,
}

// ---------------- Module items ----------------
#[derive(Clone, Debug)]
pub struct Function {
    pub type_idx: TypeIdx,
    /// Body range within the module bytes: first opcode through the final
    /// `end`. Empty for imported functions.
    pub body: Range<usize>,
    /// Parameter types followed by declared locals. Empty for imports.
    pub locals: Vec<ValType>,
    /// Operand stack high-water mark, computed during preprocessing.
    pub max_stack: u32,
    pub imported: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TableDef {
    pub limits: Limits,
    pub imported: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryDef {
    pub limits: Limits,
    pub imported: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Global {
    pub ty: GlobalType,
    /// Offset of the constant initialiser expression. Zero for imports.
    pub init_offset: usize,
    pub imported: bool,
}

#[derive(Clone, Debug)]
pub struct ElementSegment {
    pub offset_expr: usize,
    pub func_indices: Vec<FuncIdx>,
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    pub offset_expr: usize,
    pub data_range: Range<usize>,
}

// ---------------- Preprocessed jump metadata ----------------
/// A fully resolved branch: where to jump, how far to cut the operand stack
/// back, and whether one result value rides across.
#[derive(Clone, Copy, Default, Debug)]
pub struct BranchTarget {
    pub dest_pc: usize,
    pub drop_height: u32,
    pub carries_value: bool,
}

#[derive(Clone, Debug)]
pub struct BranchTable {
    pub targets: Vec<BranchTarget>,
    pub default_target: BranchTarget,
}

// ---------------- Module ----------------
/// Immutable description of a decoded, validated module. Instruction streams
/// stay in `bytes`; the side tables below let the interpreter jump without
/// searching for matching `end`s.
#[derive(Debug)]
pub struct Module {
    pub bytes: Rc<Vec<u8>>,
    pub types: Vec<FuncType>,
    /// Import entries in section order; instantiation matches supplied
    /// imports against this list positionally, per kind.
    pub imports: Vec<Import>,
    /// Function index space: imported functions first, then module-defined.
    pub functions: Vec<Function>,
    pub table: Option<TableDef>,
    pub memory: Option<MemoryDef>,
    /// Global index space: imported globals first, then module-defined.
    pub globals: Vec<Global>,
    pub exports: HashMap<String, Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    pub data_segments: Vec<DataSegment>,
    // Side tables keyed by the absolute offset of the jump instruction.
    pub branch_targets: HashMap<usize, BranchTarget>,
    pub branch_tables: HashMap<usize, BranchTable>,
    /// `if` opcode -> destination when the condition is false.
    pub if_jumps: HashMap<usize, usize>,
    /// `else` opcode -> matching `end` (end of the true branch).
    pub else_jumps: HashMap<usize, usize>,
}

/// Decode, validate and preprocess a binary module.
pub fn parse(bytes: &[u8]) -> Result<Module, Error> {
    Module::parse(bytes)
}

/// True iff `parse` would succeed on the same bytes.
pub fn validate(bytes: &[u8]) -> bool {
    Module::parse(bytes).is_ok()
}

/// Find an exported function index by name.
pub fn find_exported_function(module: &Module, name: &str) -> Option<FuncIdx> {
    match module.exports.get(name) {
        Some(Export { kind: ExternKind::Func, idx }) => Some(*idx),
        _ => None,
    }
}

const MAGIC_HEADER: &[u8; 4] = b"\0asm";

macro_rules! assert_not_empty {
    ($it:expr) => {
        if $it.empty() {
            return Err(Malformed(UNEXPECTED_END));
        }
    };
}

impl Module {
    pub const MAX_LOCALS: usize = 50000;

    pub fn parse(input: &[u8]) -> Result<Self, Error> {
        let mut m = Module {
            bytes: Rc::new(input.to_vec()),
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            exports: HashMap::new(),
            start: None,
            elements: Vec::new(),
            data_segments: Vec::new(),
            branch_targets: HashMap::new(),
            branch_tables: HashMap::new(),
            if_jumps: HashMap::new(),
            else_jumps: HashMap::new(),
        };
        m.initialize()?;
        Ok(m)
    }

    pub fn get_function_type(&self, func_idx: FuncIdx) -> &FuncType {
        &self.types[self.functions[func_idx as usize].type_idx as usize]
    }

    pub fn num_imported_functions(&self) -> usize {
        self.functions.iter().filter(|f| f.imported).count()
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes_rc = self.bytes.clone();
        let bytes: &[u8] = &bytes_rc[..];

        if bytes.len() < 4 {
            return Err(Malformed(UNEXPECTED_END));
        }
        if &bytes[0..4] != MAGIC_HEADER {
            return Err(Malformed(NO_MAGIC_HEADER));
        }
        if bytes.len() < 8 {
            return Err(Malformed(UNEXPECTED_END));
        }
        if u32::from_le_bytes(bytes[4..8].try_into().unwrap()) != 1 {
            return Err(Malformed(UNKNOWN_BINARY_VERSION));
        }
        let mut it = ByteIter::new(bytes, 8);

        section(&mut it, bytes, 1, |it| self.parse_type_section(bytes, it))?;
        section(&mut it, bytes, 2, |it| self.parse_import_section(bytes, it))?;
        section(&mut it, bytes, 3, |it| self.parse_function_section(bytes, it))?;
        section(&mut it, bytes, 4, |it| self.parse_table_section(bytes, it))?;
        section(&mut it, bytes, 5, |it| self.parse_memory_section(bytes, it))?;
        section(&mut it, bytes, 6, |it| self.parse_global_section(bytes, it))?;
        section(&mut it, bytes, 7, |it| self.parse_export_section(bytes, it))?;
        section(&mut it, bytes, 8, |it| self.parse_start_section(bytes, it))?;
        section(&mut it, bytes, 9, |it| self.parse_element_section(bytes, it))?;
        section(&mut it, bytes, 10, |it| self.parse_code_section(bytes, it))?;
        section(&mut it, bytes, 11, |it| self.parse_data_section(bytes, it))?;
        skip_custom_sections(bytes, &mut it)?;

        if !it.empty() {
            return Err(Malformed(JUNK_AFTER_LAST));
        }
        // A function section without a code section never gets bodies
        if self.functions.iter().any(|f| !f.imported && f.body.is_empty()) {
            return Err(Malformed(FUNC_CODE_INCONSISTENT));
        }
        Ok(())
    }

    fn parse_type_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_types: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        // Counts are attacker-controlled; every entry takes at least one
        // byte, so the remaining input bounds any pre-allocation
        self.types.reserve_exact(bounded(n_types, bytes, it));

        for _ in 0..n_types {
            assert_not_empty!(it);
            let byte = it.read_u8()?;
            if byte != 0x60 {
                return Err(Malformed(INVALID_VALUE_TYPE));
            }

            let n_inputs: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let mut inputs = Vec::with_capacity(bounded(n_inputs, bytes, it));
            for _ in 0..n_inputs {
                let ty = it.read_u8()?;
                inputs.push(val_type_from_byte(ty).ok_or(Malformed(INVALID_VALUE_TYPE))?);
            }

            let n_outputs: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if n_outputs > 1 {
                return Err(Malformed(INVALID_RESULT_ARITY));
            }
            let output = if n_outputs == 1 {
                let ty = it.read_u8()?;
                Some(val_type_from_byte(ty).ok_or(Malformed(INVALID_VALUE_TYPE))?)
            } else {
                None
            };

            self.types.push(FuncType { inputs, output });
        }
        Ok(())
    }

    fn parse_import_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_imports: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_imports {
            assert_not_empty!(it);
            let module_name = read_name(bytes, it)?;
            let field_name = read_name(bytes, it)?;

            let byte = it.read_u8()?;
            let kind = ExternKind::from_byte(byte).ok_or(Malformed(MALFORMED_IMPORT_KIND))?;

            let desc = match kind {
                ExternKind::Func => {
                    let type_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                    if (type_idx as usize) >= self.types.len() {
                        return Err(Validation(UNKNOWN_TYPE));
                    }
                    self.functions.push(Function {
                        type_idx,
                        body: 0..0,
                        locals: vec![],
                        max_stack: 0,
                        imported: true,
                    });
                    ImportDesc::Func(type_idx)
                }
                ExternKind::Table => {
                    if self.table.is_some() {
                        return Err(Validation(MULTIPLE_TABLES));
                    }
                    // funcref is the only element type in Wasm 1.0
                    let reftype = it.read_u8()?;
                    if reftype != 0x70 {
                        return Err(Malformed(MALFORMED_REF_TYPE));
                    }
                    let limits = read_table_limits(bytes, it)?;
                    self.table = Some(TableDef { limits, imported: true });
                    ImportDesc::Table(limits)
                }
                ExternKind::Memory => {
                    if self.memory.is_some() {
                        return Err(Validation(MULTIPLE_MEMORIES));
                    }
                    let limits = read_memory_limits(bytes, it)?;
                    self.memory = Some(MemoryDef { limits, imported: true });
                    ImportDesc::Memory(limits)
                }
                ExternKind::Global => {
                    let ty = it.read_u8()?;
                    let value_type =
                        val_type_from_byte(ty).ok_or(Malformed(INVALID_GLOBAL_TYPE))?;
                    let mut_byte = it.read_u8()?;
                    let mutable =
                        mutability_from_byte(mut_byte).ok_or(Malformed(INVALID_MUTABILITY))?;
                    let gt = GlobalType { value_type, mutable };
                    self.globals.push(Global { ty: gt, init_offset: 0, imported: true });
                    ImportDesc::Global(gt)
                }
            };

            self.imports.push(Import { module: module_name, name: field_name, desc });
        }
        Ok(())
    }

    fn parse_function_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_functions: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        self.functions.reserve(bounded(n_functions, bytes, it));

        for _ in 0..n_functions {
            assert_not_empty!(it);
            let type_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if (type_idx as usize) >= self.types.len() {
                return Err(Validation(UNKNOWN_TYPE));
            }
            self.functions.push(Function {
                type_idx,
                body: 0..0,
                locals: vec![],
                max_stack: 0,
                imported: false,
            });
        }
        Ok(())
    }

    fn parse_table_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_tables: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if n_tables > 1 || (n_tables == 1 && self.table.is_some()) {
            return Err(Validation(MULTIPLE_TABLES));
        }

        if n_tables == 1 {
            assert_not_empty!(it);
            let elem_type = it.read_u8()?;
            if elem_type != 0x70 {
                return Err(Validation(INVALID_ELEM_TYPE));
            }
            let limits = read_table_limits(bytes, it)?;
            self.table = Some(TableDef { limits, imported: false });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_memories: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if n_memories > 1 || (n_memories == 1 && self.memory.is_some()) {
            return Err(Validation(MULTIPLE_MEMORIES));
        }

        if n_memories == 1 {
            assert_not_empty!(it);
            let limits = read_memory_limits(bytes, it)?;
            self.memory = Some(MemoryDef { limits, imported: false });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_globals: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_globals {
            assert_not_empty!(it);
            let ty = it.read_u8()?;
            let value_type = val_type_from_byte(ty).ok_or(Malformed(INVALID_GLOBAL_TYPE))?;
            let mut_byte = it.read_u8()?;
            let mutable = mutability_from_byte(mut_byte).ok_or(Malformed(INVALID_MUTABILITY))?;
            let init_offset = it.cur();
            self.globals.push(Global {
                ty: GlobalType { value_type, mutable },
                init_offset,
                imported: false,
            });
            validate_const(bytes, it, value_type, &self.globals)?;
        }
        Ok(())
    }

    fn parse_export_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_exports: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_exports {
            assert_not_empty!(it);
            let name = read_name(bytes, it)?;

            let byte = it.read_u8()?;
            let kind = ExternKind::from_byte(byte).ok_or(Validation(INVALID_EXPORT_DESC))?;
            let idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

            if self.exports.contains_key(&name) {
                return Err(Validation(DUP_EXPORT_NAME));
            }

            match kind {
                ExternKind::Func => {
                    if (idx as usize) >= self.functions.len() {
                        return Err(Validation(UNKNOWN_FUNC));
                    }
                }
                ExternKind::Table => {
                    if idx != 0 || self.table.is_none() {
                        return Err(Validation(UNKNOWN_TABLE));
                    }
                }
                ExternKind::Memory => {
                    if idx != 0 || self.memory.is_none() {
                        return Err(Validation(UNKNOWN_MEMORY));
                    }
                }
                ExternKind::Global => {
                    if (idx as usize) >= self.globals.len() {
                        return Err(Validation(UNKNOWN_GLOBAL));
                    }
                }
            }

            self.exports.insert(name, Export { kind, idx });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let start: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if (start as usize) >= self.functions.len() {
            return Err(Validation(UNKNOWN_FUNC));
        }
        let ty = self.get_function_type(start);
        if !ty.inputs.is_empty() || ty.output.is_some() {
            return Err(Validation(START_FUNC));
        }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_elements: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_elements {
            assert_not_empty!(it);
            let table_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if table_idx != 0 || self.table.is_none() {
                return Err(Validation(UNKNOWN_TABLE));
            }
            let offset_expr = it.cur();
            validate_const(bytes, it, ValType::I32, &self.globals)?;

            let n_elems: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let mut func_indices = Vec::with_capacity(bounded(n_elems, bytes, it));
            for _ in 0..n_elems {
                let func_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                if (func_idx as usize) >= self.functions.len() {
                    return Err(Validation(UNKNOWN_FUNC));
                }
                func_indices.push(func_idx);
            }
            self.elements.push(ElementSegment { offset_expr, func_indices });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_bodies: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let n_imports = self.num_imported_functions() as u32;
        if (n_bodies + n_imports) as usize != self.functions.len() {
            return Err(Malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in 0..self.functions.len() {
            if self.functions[i].imported {
                continue;
            }

            let body_size: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            let entry_start = it.cur();
            if !it.has_n_left(body_size as usize) {
                return Err(Malformed(UNEXPECTED_END));
            }

            // Locals: parameters first, then the declared groups
            let mut locals = self.types[self.functions[i].type_idx as usize].inputs.clone();
            let mut n_groups: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            while n_groups > 0 {
                n_groups -= 1;
                let n_locals: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
                let ty = it.read_u8()?;
                let vt = val_type_from_byte(ty).ok_or(Validation(INVALID_LOCAL_TYPE))?;
                if locals.len() + n_locals as usize > Module::MAX_LOCALS {
                    return Err(Malformed(TOO_MANY_LOCALS));
                }
                locals.extend(std::iter::repeat(vt).take(n_locals as usize));
            }

            let body_start = it.cur();
            let body_end = entry_start + body_size as usize;
            if body_end < body_start {
                return Err(Malformed(UNEXPECTED_END));
            }

            {
                let function = &mut self.functions[i];
                function.locals = locals;
                function.body = body_start..body_end;
            }

            // Validate and preprocess the body in one pass
            Validator::new(self).validate_function(i)?;
            it.idx = body_end;
        }
        Ok(())
    }

    fn parse_data_section(&mut self, bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
        let n_segments: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;

        for _ in 0..n_segments {
            assert_not_empty!(it);
            let memory_idx: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if memory_idx != 0 {
                return Err(Validation(INVALID_DATA_SEG_FLAG));
            }
            if self.memory.is_none() {
                return Err(Validation(UNKNOWN_MEMORY));
            }

            let offset_expr = it.cur();
            validate_const(bytes, it, ValType::I32, &self.globals)?;

            let data_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
            if !it.has_n_left(data_length as usize) {
                return Err(Malformed(UNEXPECTED_END));
            }
            let data_start = it.cur();
            it.advance(data_length as usize);
            self.data_segments.push(DataSegment {
                offset_expr,
                data_range: data_start..it.cur(),
            });
        }
        Ok(())
    }
}

// ---------------- Section plumbing ----------------
#[inline]
fn bounded(count: u32, bytes: &[u8], it: &ByteIter) -> usize {
    (count as usize).min(bytes.len().saturating_sub(it.cur()))
}

fn read_name(bytes: &[u8], it: &mut ByteIter) -> Result<String, Error> {
    let len: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
    let start = it.cur();
    let end = start.checked_add(len as usize).ok_or(Malformed(UNEXPECTED_END))?;
    if end > bytes.len() {
        return Err(Malformed(UNEXPECTED_END));
    }
    let name = std::str::from_utf8(&bytes[start..end])
        .map_err(|_| Malformed(INVALID_UTF8))?
        .to_string();
    it.idx = end;
    Ok(name)
}

fn skip_custom_sections(bytes: &[u8], it: &mut ByteIter) -> Result<(), Error> {
    while !it.empty() && it.peek_u8()? == 0 {
        it.advance(1);
        let section_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let section_start = it.cur();
        let section_end = section_start
            .checked_add(section_length as usize)
            .ok_or(Malformed(UNEXPECTED_END))?;
        if section_end > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }

        // The name must decode and fit inside the section; the payload is
        // otherwise ignored
        let name_len: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let name_start = it.cur();
        let name_end = name_start
            .checked_add(name_len as usize)
            .ok_or(Malformed(UNEXPECTED_END))?;
        if name_end > section_end {
            return Err(Malformed(UNEXPECTED_END));
        }
        if std::str::from_utf8(&bytes[name_start..name_end]).is_err() {
            return Err(Malformed(INVALID_UTF8));
        }

        it.idx = section_end;
    }
    Ok(())
}

fn section<F>(it: &mut ByteIter, bytes: &[u8], id: u8, mut reader: F) -> Result<(), Error>
where
    F: FnMut(&mut ByteIter) -> Result<(), Error>,
{
    skip_custom_sections(bytes, it)?;
    if !it.empty() && it.peek_u8()? == id {
        it.advance(1);
        let section_length: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        let section_start = it.cur();
        if section_start + section_length as usize > bytes.len() {
            return Err(Malformed(UNEXPECTED_END));
        }
        reader(it)?;
        if it.cur() - section_start != section_length as usize {
            return Err(Malformed(SECTION_SIZE_MISMATCH));
        }
    } else if !it.empty() && it.peek_u8()? > 11 {
        return Err(Malformed(INVALID_SECTION_ID));
    }
    Ok(())
}

fn read_limits(bytes: &[u8], it: &mut ByteIter) -> Result<Limits, Error> {
    let flags: u32 = safe_read_leb128(bytes, &mut it.idx, 1)?;
    let min: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
    let max = if flags == 1 {
        let max: u32 = safe_read_leb128(bytes, &mut it.idx, 32)?;
        if max < min {
            return Err(Validation(MIN_GREATER_THAN_MAX));
        }
        Some(max)
    } else {
        None
    };
    Ok(Limits { min, max })
}

fn read_memory_limits(bytes: &[u8], it: &mut ByteIter) -> Result<Limits, Error> {
    let limits = read_limits(bytes, it)?;
    if limits.min > crate::memory::Memory::MAX_PAGES
        || limits.max.unwrap_or(0) > crate::memory::Memory::MAX_PAGES
    {
        return Err(Validation(MEMORY_SIZE_LIMIT));
    }
    Ok(limits)
}

fn read_table_limits(bytes: &[u8], it: &mut ByteIter) -> Result<Limits, Error> {
    read_limits(bytes, it)
}
