use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::debug_println;
use crate::error::Error::{Link, Uninstantiable, Validation};
use crate::error::*;
use crate::execute::{execute, ExecutionResult};
use crate::leb128::{read_leb128, read_sleb128};
use crate::memory::Memory;
use crate::module::{ImportDesc, Module};
use crate::types::*;
use crate::value::Value;

/// Hard cap applied to every owned memory on top of the module's declared
/// maximum, in pages (16 MiB).
pub const DEFAULT_MEMORY_PAGES_LIMIT: u32 = 256;

/// Any callable visible to Wasm code: a host closure over embedder state, or
/// a wrapped function of some instance. Receives the calling instance, the
/// arguments, and the current call depth.
pub type HostFn = Rc<dyn Fn(&Instance, &[Value], u32) -> ExecutionResult>;

#[derive(Clone)]
pub struct ExternalFunction {
    pub ty: FuncType,
    pub func: HostFn,
}

impl std::fmt::Debug for ExternalFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalFunction").field("ty", &self.ty).finish()
    }
}

/// A mutable global cell; imported cells are shared between instances.
pub struct GlobalCell {
    pub ty: GlobalType,
    pub value: Value,
}

pub type ExternalGlobal = Rc<RefCell<GlobalCell>>;
pub type ExternalMemory = Rc<RefCell<Memory>>;
pub type ExternalTable = Rc<RefCell<Table>>;

/// The funcref table: optional callables, bounded by a hard entry cap.
pub struct Table {
    elements: Vec<Option<ExternalFunction>>,
    maximum: u32,
}

impl Table {
    pub fn new(initial: u32, maximum: u32) -> Self {
        let mut elements = Vec::new();
        elements.resize_with(initial as usize, || None);
        Self { elements, maximum }
    }

    pub fn size(&self) -> u32 {
        self.elements.len() as u32
    }
    pub fn max(&self) -> u32 {
        self.maximum
    }
    pub fn get(&self, idx: u32) -> Option<&Option<ExternalFunction>> {
        self.elements.get(idx as usize)
    }
    pub fn set(&mut self, idx: u32, entry: Option<ExternalFunction>) -> Result<(), &'static str> {
        let slot = self.elements.get_mut(idx as usize).ok_or(OOB_TABLE_ACCESS)?;
        *slot = entry;
        Ok(())
    }
}

/// A module plus its runtime state. Owned stores die with the instance;
/// imported ones are shared `Rc`s and survive it.
pub struct Instance {
    pub module: Module,
    pub memory: Option<ExternalMemory>,
    pub table: Option<ExternalTable>,
    /// Global cells, imported globals first, then module-defined ones.
    pub globals: Vec<ExternalGlobal>,
    /// Resolved function imports in module import order.
    pub imported_functions: Vec<ExternalFunction>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("imported_functions", &self.imported_functions)
            .finish()
    }
}

impl Instance {
    /// Current linear memory size in bytes; 0 without a memory.
    pub fn memory_size(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.borrow().byte_size())
    }

    #[inline]
    pub(crate) fn global_value(&self, idx: usize) -> Value {
        self.globals[idx].borrow().value
    }

    #[inline]
    pub(crate) fn set_global_value(&self, idx: usize, v: Value) {
        self.globals[idx].borrow_mut().value = v;
    }
}

/// Instantiate a module: resolve imports, allocate stores, install segments,
/// run the start function. Consumes the Module.
///
/// The import vectors must match the module's import section positionally,
/// per kind.
pub fn instantiate(
    module: Module,
    imported_functions: Vec<ExternalFunction>,
    imported_tables: Vec<ExternalTable>,
    imported_memories: Vec<ExternalMemory>,
    imported_globals: Vec<ExternalGlobal>,
    memory_pages_limit: u32,
) -> Result<Rc<Instance>, Error> {
    // Import counts must match the module exactly, per kind
    let mut n_func = 0;
    let mut n_table = 0;
    let mut n_mem = 0;
    let mut n_glob = 0;
    for imp in &module.imports {
        match imp.desc {
            ImportDesc::Func(_) => n_func += 1,
            ImportDesc::Table(_) => n_table += 1,
            ImportDesc::Memory(_) => n_mem += 1,
            ImportDesc::Global(_) => n_glob += 1,
        }
    }
    if imported_functions.len() != n_func
        || imported_tables.len() != n_table
        || imported_memories.len() != n_mem
        || imported_globals.len() != n_glob
    {
        return Err(Link(UNKNOWN_IMPORT));
    }

    // Function import signatures
    {
        let mut supplied = imported_functions.iter();
        for imp in &module.imports {
            if let ImportDesc::Func(type_idx) = imp.desc {
                let f = supplied.next().unwrap();
                if f.ty != module.types[type_idx as usize] {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
            }
        }
    }

    // Table
    let table = match &module.table {
        Some(def) if def.imported => {
            let supplied = imported_tables.into_iter().next().unwrap();
            {
                let t = supplied.borrow();
                if t.size() < def.limits.min {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
                if let Some(max) = def.limits.max {
                    if t.max() > max {
                        return Err(Link(INCOMPATIBLE_IMPORT));
                    }
                }
            }
            Some(supplied)
        }
        Some(def) => Some(Rc::new(RefCell::new(Table::new(
            def.limits.min,
            def.limits.max.unwrap_or(u32::MAX),
        )))),
        None => None,
    };

    // Memory, zero-initialised and capped by both the declared maximum and
    // the embedder's page limit
    let memory = match &module.memory {
        Some(def) if def.imported => {
            let supplied = imported_memories.into_iter().next().unwrap();
            {
                let m = supplied.borrow();
                if m.size() < def.limits.min || m.size() > memory_pages_limit {
                    return Err(Link(INCOMPATIBLE_IMPORT));
                }
                if let Some(max) = def.limits.max {
                    if m.max() > max {
                        return Err(Link(INCOMPATIBLE_IMPORT));
                    }
                }
            }
            Some(supplied)
        }
        Some(def) => {
            if def.limits.min > memory_pages_limit {
                return Err(Link(MEMORY_PAGES_LIMIT_EXCEEDED));
            }
            let cap = def.limits.max.unwrap_or(memory_pages_limit).min(memory_pages_limit);
            Some(Rc::new(RefCell::new(Memory::new(def.limits.min, cap))))
        }
        None => None,
    };

    // Globals: imported cells first, then locally defined ones evaluated
    // from their constant initialisers
    let mut globals: Vec<ExternalGlobal> = Vec::with_capacity(module.globals.len());
    {
        let mut supplied = imported_globals.into_iter();
        for g in &module.globals {
            if g.imported {
                let cell = supplied.next().unwrap();
                {
                    let c = cell.borrow();
                    if c.ty != g.ty {
                        return Err(Link(INCOMPATIBLE_IMPORT));
                    }
                }
                globals.push(cell);
            } else {
                let mut pc = g.init_offset;
                let value = eval_const(&module, &mut pc, &globals)?;
                globals.push(Rc::new(RefCell::new(GlobalCell { ty: g.ty, value })));
            }
        }
    }

    // Evaluate and bounds-check every segment before writing anything, so a
    // failing segment leaves table and memory untouched
    let mut staged_elements: Vec<(u32, Vec<FuncIdx>)> = Vec::with_capacity(module.elements.len());
    for seg in &module.elements {
        let mut pc = seg.offset_expr;
        let offset = eval_const(&module, &mut pc, &globals)?.as_u32();
        let table_size = table.as_ref().ok_or(Link(ELEM_SEG_DNF))?.borrow().size();
        if (offset as u64) + (seg.func_indices.len() as u64) > table_size as u64 {
            return Err(Link(ELEM_SEG_DNF));
        }
        staged_elements.push((offset, seg.func_indices.clone()));
    }

    let mut staged_data: Vec<(u32, std::ops::Range<usize>)> =
        Vec::with_capacity(module.data_segments.len());
    for seg in &module.data_segments {
        let mut pc = seg.offset_expr;
        let offset = eval_const(&module, &mut pc, &globals)?.as_u32();
        let mem_size = memory.as_ref().ok_or(Link(DATA_SEG_DNF))?.borrow().byte_size();
        let len = seg.data_range.end - seg.data_range.start;
        if (offset as u64) + (len as u64) > mem_size as u64 {
            return Err(Link(DATA_SEG_DNF));
        }
        staged_data.push((offset, seg.data_range.clone()));
    }

    let inst = Rc::new(Instance {
        module,
        memory,
        table,
        globals,
        imported_functions,
    });

    // Install element segments; module-defined functions get Weak-backed
    // wrappers so shared tables never keep the instance alive
    for (offset, func_indices) in staged_elements {
        let table_rc = inst.table.as_ref().unwrap().clone();
        let mut t = table_rc.borrow_mut();
        for (j, func_idx) in func_indices.into_iter().enumerate() {
            let entry = wrap_function(&inst, func_idx);
            t.set(offset + j as u32, Some(entry)).map_err(|_| Link(ELEM_SEG_DNF))?;
        }
    }

    // Data segments, after elements
    for (offset, range) in staged_data {
        let mem_rc = inst.memory.as_ref().unwrap().clone();
        mem_rc
            .borrow_mut()
            .write_bytes(offset, &inst.module.bytes[range])
            .map_err(|_| Link(DATA_SEG_DNF))?;
    }

    if let Some(start) = inst.module.start {
        if execute(&inst, start, &[], 0).trapped() {
            debug_println!("instantiate: start function trapped");
            return Err(Uninstantiable(START_FUNC_TRAPPED));
        }
    }

    Ok(inst)
}

/// Wrap a function of `instance` as a callable usable from any instance.
/// Imported functions are returned as-is; module-defined ones dispatch back
/// into the interpreter through a Weak handle.
pub fn wrap_function(instance: &Rc<Instance>, func_idx: FuncIdx) -> ExternalFunction {
    let ty = instance.module.get_function_type(func_idx).clone();
    if (func_idx as usize) < instance.imported_functions.len() {
        return instance.imported_functions[func_idx as usize].clone();
    }
    let weak: Weak<Instance> = Rc::downgrade(instance);
    ExternalFunction {
        ty,
        func: Rc::new(move |_caller, args, depth| match weak.upgrade() {
            Some(inst) => execute(&inst, func_idx, args, depth),
            None => ExecutionResult::Trapped,
        }),
    }
}

/// Evaluate a constant initialiser expression. The expression was restricted
/// and typed at parse time.
fn eval_const(
    module: &Module,
    pc: &mut usize,
    globals: &[ExternalGlobal],
) -> Result<Value, Error> {
    let bytes: &[u8] = &module.bytes;
    let mut stack: Vec<Value> = Vec::new();
    loop {
        let op = bytes[*pc];
        *pc += 1;
        match op {
            0x41 => {
                let v: i32 = read_sleb128(bytes, pc)?;
                stack.push(Value::from_i32(v));
            }
            0x42 => {
                let v: i64 = read_sleb128(bytes, pc)?;
                stack.push(Value::from_i64(v));
            }
            0x43 => {
                let bits = u32::from_le_bytes(bytes[*pc..*pc + 4].try_into().unwrap());
                *pc += 4;
                stack.push(Value::from_f32_bits(bits));
            }
            0x44 => {
                let bits = u64::from_le_bytes(bytes[*pc..*pc + 8].try_into().unwrap());
                *pc += 8;
                stack.push(Value::from_f64_bits(bits));
            }
            0x23 => {
                let idx: u32 = read_leb128(bytes, pc)?;
                let cell = globals.get(idx as usize).ok_or(Validation(UNKNOWN_GLOBAL))?;
                stack.push(cell.borrow().value);
            }
            0x0b => break,
            _ => return Err(Validation(CONST_EXP_REQUIRED)),
        }
    }
    Ok(stack.pop().unwrap())
}

/// A function import candidate addressed by module and field name.
pub struct ImportedFunction {
    pub module: String,
    pub name: String,
    pub inputs: Vec<ValType>,
    pub output: Option<ValType>,
    pub func: HostFn,
}

/// Order a bag of named candidates to match the module's function imports.
/// Candidates may come in any order; surplus entries are ignored.
pub fn resolve_imported_functions(
    module: &Module,
    imported: Vec<ImportedFunction>,
) -> Result<Vec<ExternalFunction>, Error> {
    let mut out = Vec::new();
    for imp in &module.imports {
        let type_idx = match imp.desc {
            ImportDesc::Func(t) => t,
            _ => continue,
        };
        let ty = &module.types[type_idx as usize];
        let found = imported
            .iter()
            .find(|c| c.module == imp.module && c.name == imp.name)
            .ok_or(Link(UNKNOWN_IMPORT))?;
        if found.inputs != ty.inputs || found.output != ty.output {
            return Err(Link(INCOMPATIBLE_IMPORT));
        }
        out.push(ExternalFunction { ty: ty.clone(), func: found.func.clone() });
    }
    Ok(out)
}

/// `resolve_imported_functions` + `instantiate` for modules whose only
/// imports are functions.
pub fn resolve_instantiate(
    module: Module,
    imported: Vec<ImportedFunction>,
    memory_pages_limit: u32,
) -> Result<Rc<Instance>, Error> {
    let functions = resolve_imported_functions(&module, imported)?;
    instantiate(module, functions, vec![], vec![], vec![], memory_pages_limit)
}

// ---------------- Export lookup on an instance ----------------
pub fn exported_function(instance: &Rc<Instance>, name: &str) -> Option<ExternalFunction> {
    let idx = crate::module::find_exported_function(&instance.module, name)?;
    Some(wrap_function(instance, idx))
}

pub fn exported_global(instance: &Instance, name: &str) -> Option<ExternalGlobal> {
    match instance.module.exports.get(name) {
        Some(ex) if ex.kind == ExternKind::Global => {
            Some(instance.globals[ex.idx as usize].clone())
        }
        _ => None,
    }
}

pub fn exported_table(instance: &Instance, name: &str) -> Option<ExternalTable> {
    match instance.module.exports.get(name) {
        Some(ex) if ex.kind == ExternKind::Table => instance.table.clone(),
        _ => None,
    }
}

pub fn exported_memory(instance: &Instance, name: &str) -> Option<ExternalMemory> {
    match instance.module.exports.get(name) {
        Some(ex) if ex.kind == ExternKind::Memory => instance.memory.clone(),
        _ => None,
    }
}
