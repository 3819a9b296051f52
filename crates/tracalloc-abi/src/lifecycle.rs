//! Library constructor and destructor.
//!
//! The constructor stamps a `TRAC_BEG` marker on stdout and opens the gate;
//! the destructor stamps `TRAC_END`, closes the gate, drains every handler
//! (emitting free-on-shutdown records), and tears down the module map.
//! Markers go through `libc::printf` because the surrounding process may be
//! before `main` or past `exit` when these run.

use tracalloc_core::{clock, handler, modmap};

use crate::shim;

fn marker(label: *const libc::c_char) {
    let mono = clock::monotonic();
    let cpu = clock::process_cpu();
    // SAFETY: the format consumes exactly the five variadic arguments
    // passed, all c_long-sized.
    unsafe {
        libc::printf(
            c"%s:%ld.%09ld:%ld.%09ld\n".as_ptr(),
            label,
            mono.secs as libc::c_long,
            mono.nanos as libc::c_long,
            cpu.secs as libc::c_long,
            cpu.nanos as libc::c_long,
        );
    }
}

extern "C" fn setup() {
    marker(c"TRAC_BEG".as_ptr());
    shim::set_ready(true);
}

extern "C" fn teardown() {
    marker(c"TRAC_END".as_ptr());
    shim::set_ready(false);
    handler::end_all();
    modmap::end();
}

#[used]
#[unsafe(link_section = ".init_array")]
static SETUP: extern "C" fn() = setup;

#[used]
#[unsafe(link_section = ".fini_array")]
static TEARDOWN: extern "C" fn() = teardown;
