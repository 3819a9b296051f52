//! Loaded-object map: virtual addresses to `(module id, offset)`.
//!
//! Keeps a snapshot of every `PT_LOAD` segment the runtime linker reports,
//! keyed by load base for predecessor search. Shared objects get dense ids
//! in order of first sight; ids survive refreshes so trace records stay
//! comparable across library loads and unloads. Id 0 is reserved for
//! addresses covered by no known segment.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{CStr, c_int, c_void};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::RwLock;

use crate::config;

/// A program location expressed independently of load addresses.
///
/// When `module` is 0 the address lies in no known loadable segment and
/// `offset` holds the raw virtual address instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibAddr {
    pub module: usize,
    pub offset: usize,
}

/// One `PT_LOAD` segment of a loaded object.
#[derive(Debug, Clone, Copy)]
struct Segment {
    module: usize,
    base: usize,
    size: usize,
    file_offset: usize,
}

pub struct ModuleMap {
    /// Pathname → dense id; ids start at 1 and are never reassigned.
    ids: HashMap<String, usize>,
    /// Segments keyed by first virtual address.
    segments: BTreeMap<usize, Segment>,
    log: Option<BufWriter<File>>,
}

static INSTANCE: RwLock<Option<ModuleMap>> = RwLock::new(None);

impl ModuleMap {
    fn open(log_dir: Option<&Path>) -> Self {
        let log = log_dir
            .and_then(|dir| File::create(dir.join("maps.log")).ok())
            .map(BufWriter::new);
        let mut map = Self {
            ids: HashMap::new(),
            segments: BTreeMap::new(),
            log,
        };
        map.refresh();
        map
    }

    /// Rebuild the segment index from the runtime linker's current view.
    fn refresh(&mut self) {
        self.segments.clear();
        // SAFETY: the callback runs only during this call and casts `data`
        // back to the exclusive `ModuleMap` reference passed here.
        unsafe {
            libc::dl_iterate_phdr(Some(collect_segments), (self as *mut Self).cast());
        }
        if let Some(log) = &mut self.log {
            let _ = log.flush();
        }
    }

    /// Id for `name`, assigning and logging it on first sight.
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.ids.len() + 1;
        self.ids.insert(name.to_owned(), id);
        if let Some(log) = &mut self.log {
            let _ = writeln!(log, "{id}: {name}");
        }
        id
    }

    fn resolve(&self, vaddr: usize) -> LibAddr {
        if let Some((_, segment)) = self.segments.range(..=vaddr).next_back() {
            let rel = vaddr - segment.base;
            if rel < segment.size {
                return LibAddr {
                    module: segment.module,
                    offset: segment.file_offset + rel,
                };
            }
        }
        LibAddr {
            module: 0,
            offset: vaddr,
        }
    }
}

unsafe extern "C" fn collect_segments(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `data` is the `&mut ModuleMap` from `refresh`; `info` is valid
    // for the duration of the callback.
    let map = unsafe { &mut *data.cast::<ModuleMap>() };
    let info = unsafe { &*info };

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        // SAFETY: the linker hands out a NUL-terminated pathname.
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    let module = map.intern(&name);

    if info.dlpi_phdr.is_null() {
        return 0;
    }
    // SAFETY: `dlpi_phdr` points at `dlpi_phnum` program headers.
    let headers = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
    for header in headers {
        if header.p_type == libc::PT_LOAD {
            let segment = Segment {
                module,
                base: info.dlpi_addr as usize + header.p_vaddr as usize,
                size: header.p_memsz as usize,
                file_offset: header.p_offset as usize,
            };
            map.segments.insert(segment.base, segment);
        }
    }
    0
}

/// Rebuild the process snapshot, creating the map on first use.
pub fn update() {
    let mut guard = INSTANCE.write();
    match guard.as_mut() {
        Some(map) => map.refresh(),
        None => *guard = Some(ModuleMap::open(config::global().log_dir.as_deref())),
    }
}

/// Resolve `vaddr` against the current snapshot, building it on first use.
pub fn lookup(vaddr: usize) -> LibAddr {
    {
        let guard = INSTANCE.read();
        if let Some(map) = guard.as_ref() {
            return map.resolve(vaddr);
        }
    }
    // First lookup: trade the shared lock for the exclusive one and
    // double-check before populating.
    let mut guard = INSTANCE.write();
    guard
        .get_or_insert_with(|| ModuleMap::open(config::global().log_dir.as_deref()))
        .resolve(vaddr)
}

/// Drop the snapshot and close the maps log.
pub fn end() {
    *INSTANCE.write() = None;
}
