use std::fmt;
use std::marker::PhantomData;

use crate::{
    ObjBoundMethod, ObjClass, ObjClosure, ObjFun, ObjInstance, ObjNative, ObjStr, ObjUpvalue,
    Table, Value,
};

/// The collector grows its trigger threshold by this factor after each cycle.
const GC_GROWTH_FACTOR: usize = 2;

/// Bytes of live data tolerated before the first collection.
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// A typed handle to an object owned by the [`Heap`].
///
/// Handles are plain indices into the heap's object arena. They are freely
/// copyable; equality is identity of the referenced object. Because strings
/// are interned, identity equality is content equality for them too.
pub struct Gc<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Gc<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Gc<T> {}
impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Gc<T> {}
impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({})", self.index)
    }
}

/// Types that can live in the heap arena.
///
/// The trait ties each object type to its [`ObjKind`] variant so the heap can
/// hand out typed references through untyped storage.
pub trait HeapObj: Sized {
    /// Wrap the object in its storage representation.
    fn into_kind(self) -> ObjKind;
    /// Unwrap a storage slot known to hold this type.
    fn from_kind(kind: &ObjKind) -> &Self;
    /// Mutably unwrap a storage slot known to hold this type.
    fn from_kind_mut(kind: &mut ObjKind) -> &mut Self;
}

macro_rules! impl_heap_obj {
    ($ty:ident, $variant:ident) => {
        impl HeapObj for $ty {
            fn into_kind(self) -> ObjKind {
                ObjKind::$variant(self)
            }
            fn from_kind(kind: &ObjKind) -> &Self {
                match kind {
                    ObjKind::$variant(obj) => obj,
                    _ => panic!("Invalid cast"),
                }
            }
            fn from_kind_mut(kind: &mut ObjKind) -> &mut Self {
                match kind {
                    ObjKind::$variant(obj) => obj,
                    _ => panic!("Invalid cast"),
                }
            }
        }
    };
}

impl_heap_obj!(ObjStr, Str);
impl_heap_obj!(ObjFun, Fun);
impl_heap_obj!(ObjNative, Native);
impl_heap_obj!(ObjUpvalue, Upvalue);
impl_heap_obj!(ObjClosure, Closure);
impl_heap_obj!(ObjClass, Class);
impl_heap_obj!(ObjInstance, Instance);
impl_heap_obj!(ObjBoundMethod, BoundMethod);

/// Storage representation of a heap object.
#[derive(Debug)]
pub enum ObjKind {
    /// An interned string
    Str(ObjStr),
    /// A compiled function
    Fun(ObjFun),
    /// A native function
    Native(ObjNative),
    /// A captured variable
    Upvalue(ObjUpvalue),
    /// A function plus its captured variables
    Closure(ObjClosure),
    /// A class
    Class(ObjClass),
    /// A class instance
    Instance(ObjInstance),
    /// A method bound to an instance
    BoundMethod(ObjBoundMethod),
}

impl ObjKind {
    /// Push the arena indices of every object directly referenced by this
    /// one. This is the blackening step's view of the object graph.
    fn children(&self, out: &mut Vec<usize>) {
        let push_value = |out: &mut Vec<usize>, value: Value| {
            if let Some(index) = value.object_index() {
                out.push(index);
            }
        };
        match self {
            Self::Str(_) => {}
            Self::Fun(fun) => {
                if let Some(name) = fun.name {
                    out.push(name.index());
                }
                for &constant in fun.chunk.constants() {
                    push_value(out, constant);
                }
            }
            Self::Native(native) => out.push(native.name.index()),
            Self::Upvalue(ObjUpvalue::Open(_)) => {}
            Self::Upvalue(ObjUpvalue::Closed(value)) => push_value(out, *value),
            Self::Closure(closure) => {
                out.push(closure.fun.index());
                for upvalue in &closure.upvalues {
                    out.push(upvalue.index());
                }
            }
            Self::Class(class) => {
                out.push(class.name.index());
                for (key, value) in class.methods.iter() {
                    out.push(key.index());
                    push_value(out, value);
                }
            }
            Self::Instance(instance) => {
                out.push(instance.class.index());
                for (key, value) in instance.fields.iter() {
                    out.push(key.index());
                    push_value(out, value);
                }
            }
            Self::BoundMethod(bound) => {
                push_value(out, bound.receiver);
                out.push(bound.method.index());
            }
        }
    }

    /// Bytes owned by the object beyond its arena slot.
    fn heap_size(&self) -> usize {
        match self {
            Self::Str(s) => s.data.capacity(),
            Self::Fun(fun) => fun.chunk.heap_size(),
            Self::Native(_) => 0,
            Self::Upvalue(_) => 0,
            Self::Closure(closure) => {
                closure.upvalues.capacity() * std::mem::size_of::<Gc<ObjUpvalue>>()
            }
            Self::Class(class) => class.methods.heap_size(),
            Self::Instance(instance) => instance.fields.heap_size(),
            Self::BoundMethod(_) => 0,
        }
    }
}

#[derive(Debug)]
struct Obj {
    marked: bool,
    size: usize,
    kind: ObjKind,
}

/// The object arena, string interner, and mark-sweep collector.
///
/// Every heap object of the virtual machine lives in exactly one arena slot
/// until a collection finds it unreachable. The heap never decides on its own
/// when to collect: mutators (the VM and the compiler) check
/// [`should_collect`][Heap::should_collect] at their allocation points, mark
/// their roots, and then run [`collect`][Heap::collect]. This keeps root
/// marking where the roots are known while the tracing and sweeping live
/// here.
#[derive(Debug)]
pub struct Heap {
    objects: Vec<Option<Obj>>,
    free_slots: Vec<usize>,
    strings: Table,
    gray: Vec<usize>,
    scratch: Vec<usize>,
    /// Roots re-marked at the start of every collection, for the window
    /// where allocations are driven by a mutator that cannot see them
    pinned: Vec<usize>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            free_slots: Vec::new(),
            strings: Table::default(),
            gray: Vec::new(),
            scratch: Vec::new(),
            pinned: Vec::new(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
            stress: false,
        }
    }
}

impl Heap {
    /// Read the object behind a handle.
    ///
    /// # Panics
    ///
    /// Panics when the handle does not refer to a live object of type `T`.
    /// Handles reachable from the running program are always live.
    pub fn get<T: HeapObj>(&self, gc: Gc<T>) -> &T {
        T::from_kind(
            &self.objects[gc.index()]
                .as_ref()
                .expect("A referenced object must be live.")
                .kind,
        )
    }

    /// Mutably read the object behind a handle.
    ///
    /// # Panics
    ///
    /// Same conditions as [`get`][Heap::get].
    pub fn get_mut<T: HeapObj>(&mut self, gc: Gc<T>) -> &mut T {
        T::from_kind_mut(
            &mut self.objects[gc.index()]
                .as_mut()
                .expect("A referenced object must be live.")
                .kind,
        )
    }

    /// Whether the mutator should run a collection before its next
    /// allocation.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Force a collection at every allocation point. Meant for flushing out
    /// missing-root bugs; the collector must never free something the program
    /// can still reach, no matter how often it runs.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Total bytes accounted to live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    /// Move an object into the arena and hand back a typed handle. The
    /// caller is responsible for having collected first if it wanted to; the
    /// new object is born unmarked.
    pub(crate) fn alloc<T: HeapObj>(&mut self, obj: T) -> Gc<T> {
        self.alloc_kind(obj.into_kind())
    }

    /// Like [`alloc`][Heap::alloc] for an object already wrapped in its
    /// storage representation. `T` must match the wrapped variant.
    pub(crate) fn alloc_kind<T: HeapObj>(&mut self, kind: ObjKind) -> Gc<T> {
        let size = std::mem::size_of::<Obj>() + kind.heap_size();
        self.bytes_allocated += size;
        let obj = Obj {
            marked: false,
            size,
            kind,
        };
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.objects[index] = Some(obj);
                index
            }
            None => {
                self.objects.push(Some(obj));
                self.objects.len() - 1
            }
        };
        Gc::new(index)
    }

    /// Return the unique string object for the given content, allocating it
    /// on first sight.
    pub(crate) fn intern(&mut self, s: &str) -> Gc<ObjStr> {
        let hash = ObjStr::hash_bytes(s);
        let objects = &self.objects;
        let existing = self.strings.find_key(hash, |key| {
            let obj = objects[key.index()]
                .as_ref()
                .expect("The interner only holds live strings.");
            ObjStr::from_kind(&obj.kind).data == s
        });
        if let Some(existing) = existing {
            return existing;
        }
        let gc = self.alloc(ObjStr {
            data: s.to_owned(),
            hash,
        });
        self.strings.set(gc, hash, Value::Nil);
        gc
    }

    /// Mark the object behind a handle as reachable.
    pub(crate) fn mark<T>(&mut self, gc: Gc<T>) {
        self.mark_raw(gc.index());
    }

    /// Mark the object a value refers to, if any.
    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Some(index) = value.object_index() {
            self.mark_raw(index);
        }
    }

    /// Mark everything a not-yet-allocated object refers to. Mutators call
    /// this for the object they are about to allocate, so a collection at
    /// the allocation point cannot free the children it already owns.
    pub(crate) fn mark_children_of(&mut self, kind: &ObjKind) {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        kind.children(&mut scratch);
        for child in scratch.drain(..) {
            self.mark_raw(child);
        }
        self.scratch = scratch;
    }

    /// Keep the given objects alive across every collection until the next
    /// [`clear_pinned`][Heap::clear_pinned]. The virtual machine pins its own
    /// roots around compilation, whose allocations only know about the
    /// compiler's roots.
    pub(crate) fn set_pinned(&mut self, pinned: Vec<usize>) {
        self.pinned = pinned;
    }

    /// Drop the pinned roots installed by [`set_pinned`][Heap::set_pinned].
    pub(crate) fn clear_pinned(&mut self) {
        self.pinned.clear();
    }

    /// Trace the object graph from the marked roots, then free everything
    /// left unmarked. Marks are cleared on survivors, so a fresh cycle can
    /// begin at any time.
    pub(crate) fn collect(&mut self) {
        let pinned = std::mem::take(&mut self.pinned);
        for &index in &pinned {
            self.mark_raw(index);
        }
        self.pinned = pinned;
        self.trace_references();
        self.sweep();
    }

    fn mark_raw(&mut self, index: usize) {
        let obj = self.objects[index]
            .as_mut()
            .expect("A marked object must be live.");
        if !obj.marked {
            obj.marked = true;
            self.gray.push(index);
        }
    }

    /// Blacken gray objects until the worklist is empty.
    fn trace_references(&mut self) {
        while let Some(index) = self.gray.pop() {
            self.blacken(index);
        }
    }

    fn blacken(&mut self, index: usize) {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        if let Some(obj) = self.objects[index].as_ref() {
            obj.kind.children(&mut scratch);
        }
        for child in scratch.drain(..) {
            self.mark_raw(child);
        }
        self.scratch = scratch;
    }

    fn sweep(&mut self) {
        // The interner must not keep strings alive, and it must not dangle:
        // purge unmarked keys before their slots are freed.
        let objects = &self.objects;
        self.strings
            .retain_keys(|key| objects[key.index()].as_ref().is_some_and(|obj| obj.marked));

        for index in 0..self.objects.len() {
            let marked = match &self.objects[index] {
                Some(obj) => obj.marked,
                None => continue,
            };
            if marked {
                self.objects[index]
                    .as_mut()
                    .expect("Just observed the slot.")
                    .marked = false;
            } else {
                let obj = self.objects[index]
                    .take()
                    .expect("Just observed the slot.");
                self.bytes_allocated -= obj.size;
                self.free_slots.push(index);
            }
        }
        self.next_gc = self.bytes_allocated * GC_GROWTH_FACTOR;
    }
}
