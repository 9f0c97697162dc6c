use std::fmt;

use crate::{Chunk, Gc, Table, Value};

/// An immutable interned string and its precomputed hash.
///
/// The interner guarantees that at most one `ObjStr` exists for a given byte
/// content, so handle equality is also content equality.
#[derive(Debug)]
pub struct ObjStr {
    /// The string content
    pub data: String,
    /// FNV-1a hash of the content, computed once at allocation
    pub hash: u32,
}

impl ObjStr {
    /// Create a string object, hashing its content.
    pub fn new(data: String) -> Self {
        let hash = Self::hash_bytes(&data);
        Self { data, hash }
    }

    /// FNV-1a on the string's bytes, 32-bit variant.
    pub fn hash_bytes(s: &str) -> u32 {
        let mut hash = 2166136261u32;
        for b in s.bytes() {
            hash ^= u32::from(b);
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }
}

/// A function object that holds the bytecode of the function along with other
/// metadata
#[derive(Debug)]
pub struct ObjFun {
    /// The name of the function, `None` for the top-level script
    pub name: Option<Gc<ObjStr>>,
    /// Number of parameters the function has
    pub arity: u8,
    /// Number of variables the function captures from enclosing scopes
    pub upvalue_count: usize,
    /// The bytecode chunk of this function
    pub chunk: Chunk,
}

impl ObjFun {
    /// Create a function object with no code, no parameters, and no upvalues.
    pub fn new(name: Option<Gc<ObjStr>>) -> Self {
        Self {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::default(),
        }
    }
}

/// A structure for managing closed-over value
#[derive(Debug)]
pub enum ObjUpvalue {
    /// This field stores a slot offset which points to a value that was captured
    Open(usize),
    /// This stores the closed over value
    Closed(Value),
}

/// A function that captures its surrounding environment
#[derive(Debug)]
pub struct ObjClosure {
    /// The base function of this closure
    pub fun: Gc<ObjFun>,
    /// Upvalues for indirect access to closed-over variables
    pub upvalues: Vec<Gc<ObjUpvalue>>,
}

/// A class object holding the methods shared by its instances
#[derive(Debug)]
pub struct ObjClass {
    /// Class name
    pub name: Gc<ObjStr>,
    /// Maps method names to closures
    pub methods: Table,
}

impl ObjClass {
    /// Create a class with an empty method table.
    pub fn new(name: Gc<ObjStr>) -> Self {
        Self {
            name,
            methods: Table::default(),
        }
    }
}

/// A class instance and its fields
#[derive(Debug)]
pub struct ObjInstance {
    /// The class this is an instance of
    pub class: Gc<ObjClass>,
    /// Maps field names to values
    pub fields: Table,
}

impl ObjInstance {
    /// Create an instance with no fields.
    pub fn new(class: Gc<ObjClass>) -> Self {
        Self {
            class,
            fields: Table::default(),
        }
    }
}

/// A method closure paired with the instance it was accessed through
#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    /// The value of `this` inside the method body
    pub receiver: Value,
    /// The method being bound
    pub method: Gc<ObjClosure>,
}

/// Calling convention for functions implemented in Rust. An `Err` is
/// reported by the virtual machine as a runtime error.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// A native function
#[derive(Clone, Copy)]
pub struct ObjNative {
    /// Function's name
    pub name: Gc<ObjStr>,
    /// Number of parameters
    pub arity: u8,
    /// Native function reference
    pub call: NativeFn,
}

impl fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn>")
    }
}
