//! Hand encoders for Wasm 1.0 binaries used by the integration tests.
#![allow(dead_code)]

// ---------------- Value type bytes ----------------
pub const I32: u8 = 0x7f;
pub const I64: u8 = 0x7e;
pub const F32: u8 = 0x7d;
pub const F64: u8 = 0x7c;
pub const VOID_BLOCK: u8 = 0x40;
pub const FUNCREF: u8 = 0x70;

// ---------------- Opcodes ----------------
pub mod op {
    pub const UNREACHABLE: u8 = 0x00;
    pub const NOP: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const LOOP: u8 = 0x03;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0b;
    pub const BR: u8 = 0x0c;
    pub const BR_IF: u8 = 0x0d;
    pub const BR_TABLE: u8 = 0x0e;
    pub const RETURN: u8 = 0x0f;
    pub const CALL: u8 = 0x10;
    pub const CALL_INDIRECT: u8 = 0x11;
    pub const DROP: u8 = 0x1a;
    pub const SELECT: u8 = 0x1b;
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const LOCAL_TEE: u8 = 0x22;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;
    pub const I32_LOAD: u8 = 0x28;
    pub const I64_LOAD: u8 = 0x29;
    pub const I32_LOAD8_S: u8 = 0x2c;
    pub const I32_LOAD8_U: u8 = 0x2d;
    pub const I32_LOAD16_U: u8 = 0x2f;
    pub const I32_STORE: u8 = 0x36;
    pub const I64_STORE: u8 = 0x37;
    pub const I32_STORE8: u8 = 0x3a;
    pub const MEMORY_SIZE: u8 = 0x3f;
    pub const MEMORY_GROW: u8 = 0x40;
    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const F32_CONST: u8 = 0x43;
    pub const F64_CONST: u8 = 0x44;
    pub const I32_EQZ: u8 = 0x45;
    pub const I32_EQ: u8 = 0x46;
    pub const I32_LT_S: u8 = 0x48;
    pub const I32_LT_U: u8 = 0x49;
    pub const I32_GT_S: u8 = 0x4a;
    pub const I32_ADD: u8 = 0x6a;
    pub const I32_SUB: u8 = 0x6b;
    pub const I32_MUL: u8 = 0x6c;
    pub const I32_DIV_S: u8 = 0x6d;
    pub const I32_DIV_U: u8 = 0x6e;
    pub const I32_REM_S: u8 = 0x6f;
    pub const I32_AND: u8 = 0x71;
    pub const I32_SHL: u8 = 0x74;
    pub const I32_ROTL: u8 = 0x77;
    pub const I32_CLZ: u8 = 0x67;
    pub const I64_ADD: u8 = 0x7c;
    pub const I64_DIV_S: u8 = 0x7f;
    pub const I64_MUL: u8 = 0x7e;
    pub const F32_ADD: u8 = 0x92;
    pub const F32_DIV: u8 = 0x95;
    pub const F32_MIN: u8 = 0x96;
    pub const F32_MAX: u8 = 0x97;
    pub const F64_ADD: u8 = 0xa0;
    pub const F64_MIN: u8 = 0xa4;
    pub const F64_MAX: u8 = 0xa5;
    pub const F64_COPYSIGN: u8 = 0xa6;
    pub const I32_WRAP_I64: u8 = 0xa7;
    pub const I32_TRUNC_F32_S: u8 = 0xa8;
    pub const I32_TRUNC_F64_S: u8 = 0xaa;
    pub const I32_TRUNC_F64_U: u8 = 0xab;
    pub const I64_EXTEND_I32_S: u8 = 0xac;
    pub const I64_EXTEND_I32_U: u8 = 0xad;
    pub const I64_TRUNC_F64_S: u8 = 0xb0;
    pub const F32_CONVERT_I32_S: u8 = 0xb2;
    pub const F64_CONVERT_I64_U: u8 = 0xba;
    pub const F32_NEAREST: u8 = 0x90;
    pub const I32_REINTERPRET_F32: u8 = 0xbc;
    pub const F32_REINTERPRET_I32: u8 = 0xbe;
}

// ---------------- LEB128 ----------------
pub fn uleb(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
    out
}

pub fn sleb(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        let sign = b & 0x40 != 0;
        let done = (v == 0 && !sign) || (v == -1 && sign);
        out.push(if done { b } else { b | 0x80 });
        if done {
            break;
        }
    }
    out
}

pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

// ---------------- Sections ----------------
pub fn module(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut out = b"\0asm\x01\0\0\0".to_vec();
    for s in sections {
        out.extend_from_slice(s);
    }
    out
}

pub fn section(id: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(uleb(payload.len() as u64));
    out.extend(payload);
    out
}

fn vector(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = uleb(items.len() as u64);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

pub fn func_type(params: &[u8], result: Option<u8>) -> Vec<u8> {
    let mut out = vec![0x60];
    out.extend(uleb(params.len() as u64));
    out.extend_from_slice(params);
    match result {
        Some(r) => {
            out.extend(uleb(1));
            out.push(r);
        }
        None => out.extend(uleb(0)),
    }
    out
}

pub fn type_section(types: &[Vec<u8>]) -> Vec<u8> {
    section(1, vector(types))
}

pub fn import_entry(module_name: &str, field: &str, desc: &[u8]) -> Vec<u8> {
    let mut out = uleb(module_name.len() as u64);
    out.extend_from_slice(module_name.as_bytes());
    out.extend(uleb(field.len() as u64));
    out.extend_from_slice(field.as_bytes());
    out.extend_from_slice(desc);
    out
}

pub fn import_func_desc(type_idx: u32) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend(uleb(type_idx as u64));
    out
}

pub fn import_global_desc(val_type: u8, mutable: bool) -> Vec<u8> {
    vec![0x03, val_type, mutable as u8]
}

pub fn import_memory_desc(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut out = vec![0x02];
    out.extend(limits(min, max));
    out
}

pub fn import_table_desc(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut out = vec![0x01, FUNCREF];
    out.extend(limits(min, max));
    out
}

pub fn import_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(2, vector(entries))
}

pub fn function_section(type_indices: &[u32]) -> Vec<u8> {
    let entries: Vec<Vec<u8>> = type_indices.iter().map(|&i| uleb(i as u64)).collect();
    section(3, vector(&entries))
}

pub fn limits(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    match max {
        Some(max) => {
            out.push(0x01);
            out.extend(uleb(min as u64));
            out.extend(uleb(max as u64));
        }
        None => {
            out.push(0x00);
            out.extend(uleb(min as u64));
        }
    }
    out
}

pub fn table_section(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut entry = vec![FUNCREF];
    entry.extend(limits(min, max));
    section(4, vector(&[entry]))
}

pub fn memory_section(min: u32, max: Option<u32>) -> Vec<u8> {
    section(5, vector(&[limits(min, max)]))
}

pub fn global_entry(val_type: u8, mutable: bool, init: &[u8]) -> Vec<u8> {
    let mut out = vec![val_type, mutable as u8];
    out.extend_from_slice(init);
    out.push(op::END);
    out
}

pub fn global_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(6, vector(entries))
}

pub fn export_entry(name: &str, kind: u8, idx: u32) -> Vec<u8> {
    let mut out = uleb(name.len() as u64);
    out.extend_from_slice(name.as_bytes());
    out.push(kind);
    out.extend(uleb(idx as u64));
    out
}

pub fn export_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(7, vector(entries))
}

pub fn start_section(func_idx: u32) -> Vec<u8> {
    section(8, uleb(func_idx as u64))
}

pub fn element_entry(offset_init: &[u8], func_indices: &[u32]) -> Vec<u8> {
    let mut out = uleb(0);
    out.extend_from_slice(offset_init);
    out.push(op::END);
    out.extend(uleb(func_indices.len() as u64));
    for &f in func_indices {
        out.extend(uleb(f as u64));
    }
    out
}

pub fn element_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(9, vector(entries))
}

pub fn code_entry(local_groups: &[(u32, u8)], body: &[u8]) -> Vec<u8> {
    let mut content = uleb(local_groups.len() as u64);
    for &(n, ty) in local_groups {
        content.extend(uleb(n as u64));
        content.push(ty);
    }
    content.extend_from_slice(body);
    let mut out = uleb(content.len() as u64);
    out.extend(content);
    out
}

pub fn code_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(10, vector(entries))
}

pub fn data_entry(offset_init: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = uleb(0);
    out.extend_from_slice(offset_init);
    out.push(op::END);
    out.extend(uleb(data.len() as u64));
    out.extend_from_slice(data);
    out
}

pub fn data_section(entries: &[Vec<u8>]) -> Vec<u8> {
    section(11, vector(entries))
}

pub fn custom_section(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut content = uleb(name.len() as u64);
    content.extend_from_slice(name.as_bytes());
    content.extend_from_slice(payload);
    section(0, content)
}

pub fn i32_const(v: i32) -> Vec<u8> {
    let mut out = vec![op::I32_CONST];
    out.extend(sleb(v as i64));
    out
}

pub fn i64_const(v: i64) -> Vec<u8> {
    let mut out = vec![op::I64_CONST];
    out.extend(sleb(v));
    out
}

pub fn f32_const(v: f32) -> Vec<u8> {
    let mut out = vec![op::F32_CONST];
    out.extend_from_slice(&v.to_bits().to_le_bytes());
    out
}

pub fn f64_const(v: f64) -> Vec<u8> {
    let mut out = vec![op::F64_CONST];
    out.extend_from_slice(&v.to_bits().to_le_bytes());
    out
}

// ---------------- Canned modules ----------------
/// (module (func (export "add") (param i32 i32) (result i32)
///   local.get 0 local.get 1 i32.add))
pub fn add_module() -> Vec<u8> {
    module(&[
        type_section(&[func_type(&[I32, I32], Some(I32))]),
        function_section(&[0]),
        export_section(&[export_entry("add", 0, 0)]),
        code_section(&[code_entry(
            &[],
            &[op::LOCAL_GET, 0, op::LOCAL_GET, 1, op::I32_ADD, op::END],
        )]),
    ])
}

/// A module with one page of memory and `load8 : (i32) -> i32` reading an
/// unsigned byte, plus an exported memory.
pub fn load8_module() -> Vec<u8> {
    module(&[
        type_section(&[func_type(&[I32], Some(I32))]),
        function_section(&[0]),
        memory_section(1, Some(1)),
        export_section(&[export_entry("load8", 0, 0), export_entry("memory", 2, 0)]),
        code_section(&[code_entry(
            &[],
            &[op::LOCAL_GET, 0, op::I32_LOAD8_U, 0, 0, op::END],
        )]),
    ])
}
