// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The generic filter runner child.
//!
//! One instance hosts one filter module for the lifetime of a search.
//! The engine speaks the framed pipe protocol on our original stdin and
//! stdout; those fds are remapped away immediately so filter code that
//! prints to stdout cannot corrupt the framing — its output lands in a
//! pipe a forwarder thread ships back as `stdout` messages.
//!
//! Filter modules expose a C ABI:
//!
//! ```text
//! int    <init>(int num_args, const char *const *args,
//!               int bloblen, const void *blob,
//!               const char *filter_name, void **state);
//! double <eval>(void *handle, const diamond_calls *calls, void *state);
//! int    <fini>(void *state);
//! ```
//!
//! The handle is opaque; every attribute access goes through the calls
//! table, which re-enters the pipe protocol synchronously.

use std::{
    collections::HashMap,
    ffi::{CStr, CString, c_char, c_double, c_int, c_void},
    fs::File,
    io::{BufReader, Read},
    os::fd::FromRawFd,
    process::exit,
    sync::Mutex,
};

use anyhow::{Context, Result, bail};
use diamondd::runner::framing::{BlockingFrameReader, BlockingFrameWriter};
use libloading::Library;

type InitFn = unsafe extern "C" fn(
    c_int,
    *const *const c_char,
    c_int,
    *const c_void,
    *const c_char,
    *mut *mut c_void,
) -> c_int;
type EvalFn =
    unsafe extern "C" fn(*mut c_void, *const FilterCalls, *mut c_void) -> c_double;
type FiniFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Callback table handed to eval; the handle pointer is the first
/// argument of every entry.
#[repr(C)]
struct FilterCalls {
    read_attr: unsafe extern "C" fn(
        *mut c_void,
        *const c_char,
        *mut usize,
        *mut *const u8,
    ) -> c_int,
    write_attr:
        unsafe extern "C" fn(*mut c_void, *const c_char, usize, *const u8) -> c_int,
    omit_attr: unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int,
    log: unsafe extern "C" fn(*mut c_void, c_int, *const c_char),
    get_session_var:
        unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_double) -> c_int,
    update_session_var:
        unsafe extern "C" fn(*mut c_void, *const c_char, c_double) -> c_int,
}

static CALLS: FilterCalls = FilterCalls {
    read_attr: cb_read_attr,
    write_attr: cb_write_attr,
    omit_attr: cb_omit_attr,
    log: cb_log,
    get_session_var: cb_get_session_var,
    update_session_var: cb_update_session_var,
};

/// Per-eval state behind the opaque handle: the protocol endpoints plus
/// a local cache of attributes already fetched for this object, which
/// keeps the returned pointers alive until the eval finishes.
struct ObjHandle<'a> {
    reader: &'a mut BlockingFrameReader<BufReader<File>>,
    writer: &'a Mutex<BlockingFrameWriter<File>>,
    attrs: HashMap<String, Option<Box<[u8]>>>,
}

fn lock_writer(
    writer: &Mutex<BlockingFrameWriter<File>>,
) -> std::sync::MutexGuard<'_, BlockingFrameWriter<File>> {
    // A poisoned lock means another thread already died on a broken
    // pipe; nothing sensible remains but to follow it.
    writer.lock().unwrap_or_else(|_| exit(1))
}

impl ObjHandle<'_> {
    fn fetch_attr(&mut self, name: &str) -> Result<Option<&[u8]>> {
        if !self.attrs.contains_key(name) {
            {
                let mut w = lock_writer(self.writer);
                w.write_tag("get-attribute")?;
                w.write_string(name)?;
            }
            let value = self.reader.read_binary()?;
            self.attrs
                .insert(name.to_string(), value.map(Vec::into_boxed_slice));
        }
        Ok(self
            .attrs
            .get(name)
            .and_then(|v| v.as_deref()))
    }

    fn store_attr(&mut self, name: &str, data: &[u8]) -> Result<()> {
        {
            let mut w = lock_writer(self.writer);
            w.write_tag("set-attribute")?;
            w.write_string(name)?;
            w.write_binary(data)?;
        }
        self.attrs
            .insert(name.to_string(), Some(data.to_vec().into_boxed_slice()));
        Ok(())
    }

    fn drop_attr(&mut self, name: &str) -> Result<bool> {
        {
            let mut w = lock_writer(self.writer);
            w.write_tag("omit-attribute")?;
            w.write_string(name)?;
        }
        let reply = self.reader.read_string()?.unwrap_or_default();
        Ok(reply == "true")
    }
}

unsafe fn handle_mut<'a>(handle: *mut c_void) -> &'a mut ObjHandle<'a> {
    unsafe { &mut *handle.cast::<ObjHandle<'a>>() }
}

unsafe fn cstr<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("")
}

unsafe extern "C" fn cb_read_attr(
    handle: *mut c_void,
    name: *const c_char,
    len: *mut usize,
    data: *mut *const u8,
) -> c_int {
    let h = unsafe { handle_mut(handle) };
    let name = unsafe { cstr(name) };
    match h.fetch_attr(name) {
        Ok(Some(value)) => unsafe {
            *len = value.len();
            *data = value.as_ptr();
            0
        },
        Ok(None) => libc::ENOENT,
        Err(_) => exit(1),
    }
}

unsafe extern "C" fn cb_write_attr(
    handle: *mut c_void,
    name: *const c_char,
    len: usize,
    data: *const u8,
) -> c_int {
    let h = unsafe { handle_mut(handle) };
    let name = unsafe { cstr(name) };
    let value = if data.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data, len) }
    };
    match h.store_attr(name, value) {
        Ok(()) => 0,
        Err(_) => exit(1),
    }
}

unsafe extern "C" fn cb_omit_attr(handle: *mut c_void, name: *const c_char) -> c_int {
    let h = unsafe { handle_mut(handle) };
    let name = unsafe { cstr(name) };
    match h.drop_attr(name) {
        Ok(true) => 0,
        Ok(false) => libc::ENOENT,
        Err(_) => exit(1),
    }
}

unsafe extern "C" fn cb_log(handle: *mut c_void, level: c_int, msg: *const c_char) {
    let h = unsafe { handle_mut(handle) };
    let msg = unsafe { cstr(msg) };
    let mut w = lock_writer(h.writer);
    let ok = w
        .write_tag("log")
        .and_then(|()| w.write_int(level as i64))
        .and_then(|()| w.write_string(msg));
    if ok.is_err() {
        exit(1);
    }
}

unsafe extern "C" fn cb_get_session_var(
    handle: *mut c_void,
    name: *const c_char,
    out: *mut c_double,
) -> c_int {
    let h = unsafe { handle_mut(handle) };
    let name = unsafe { cstr(name) };
    {
        let mut w = lock_writer(h.writer);
        let ok = w
            .write_tag("get-session-variables")
            .and_then(|()| w.write_string(name))
            .and_then(|()| w.write_none());
        if ok.is_err() {
            exit(1);
        }
    }
    match h.reader.read_double() {
        Ok(v) => unsafe {
            *out = v;
            0
        },
        Err(_) => exit(1),
    }
}

unsafe extern "C" fn cb_update_session_var(
    handle: *mut c_void,
    name: *const c_char,
    value: c_double,
) -> c_int {
    let h = unsafe { handle_mut(handle) };
    let name = unsafe { cstr(name) };
    let mut w = lock_writer(h.writer);
    let ok = w
        .write_tag("update-session-variables")
        .and_then(|()| w.write_string(name))
        .and_then(|()| w.write_none())
        .and_then(|()| w.write_double(value));
    if ok.is_err() {
        exit(1);
    }
    0
}

// ─────────────────────────────────────────────────────────────────────────────
// fd plumbing

fn check(result: c_int, what: &str) -> c_int {
    if result < 0 {
        eprintln!("diamond-filter-runner: {what} failed");
        exit(1);
    }
    result
}

/// Save the engine pipes away from fd 0/1, point fd 0 at /dev/null and
/// fd 1 at a capture pipe. Returns (engine_in, engine_out, captured
/// stdout read end).
fn remap_fds() -> (File, File, File) {
    unsafe {
        let engine_in = check(libc::dup(0), "dup stdin");
        let engine_out = check(libc::dup(1), "dup stdout");

        let devnull = check(
            libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY),
            "open /dev/null",
        );
        check(libc::dup2(devnull, 0), "dup2 stdin");
        check(libc::close(devnull), "close /dev/null");

        let mut capture: [c_int; 2] = [0; 2];
        check(libc::pipe(capture.as_mut_ptr()), "pipe");
        check(libc::dup2(capture[1], 1), "dup2 stdout");
        check(libc::close(capture[1]), "close pipe");

        (
            File::from_raw_fd(engine_in),
            File::from_raw_fd(engine_out),
            File::from_raw_fd(capture[0]),
        )
    }
}

/// Forward everything the filter prints to stdout as framed `stdout`
/// messages. The writer mutex keeps these frames from interleaving with
/// the eval thread's messages.
fn forward_stdout(mut captured: File, writer: &Mutex<BlockingFrameWriter<File>>) {
    let mut buf = [0u8; 4096];
    loop {
        match captured.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut w = lock_writer(writer);
                let ok = w
                    .write_tag("stdout")
                    .and_then(|()| w.write_binary(&buf[..n]));
                if ok.is_err() {
                    exit(1);
                }
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────

struct LoadedFilter {
    // Keeps the module alive for the symbols' lifetime.
    _library: Library,
    eval: EvalFn,
    fini: FiniFn,
    state: *mut c_void,
}

fn load_filter(
    reader: &mut BlockingFrameReader<BufReader<File>>,
    writer: &Mutex<BlockingFrameWriter<File>>,
) -> Result<LoadedFilter> {
    let module = reader
        .read_string()?
        .context("handshake: missing module path")?;
    let init_name = reader
        .read_string()?
        .context("handshake: missing init symbol")?;
    let eval_name = reader
        .read_string()?
        .context("handshake: missing eval symbol")?;
    let fini_name = reader
        .read_string()?
        .context("handshake: missing fini symbol")?;
    let args = reader.read_string_list()?;
    let blob = reader.read_binary()?.unwrap_or_default();
    let filter_name = reader
        .read_string()?
        .context("handshake: missing filter name")?;

    let library = unsafe { Library::new(&module) }
        .with_context(|| format!("cannot load filter module {module}"))?;

    let (init, eval, fini) = unsafe {
        let init = *library
            .get::<InitFn>(init_name.as_bytes())
            .with_context(|| format!("symbol {init_name} not found"))?;
        let eval = *library
            .get::<EvalFn>(eval_name.as_bytes())
            .with_context(|| format!("symbol {eval_name} not found"))?;
        let fini = *library
            .get::<FiniFn>(fini_name.as_bytes())
            .with_context(|| format!("symbol {fini_name} not found"))?;
        (init, eval, fini)
    };

    lock_writer(writer).write_tag("functions-resolved")?;

    let c_args: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .context("filter argument contains NUL")?;
    let arg_ptrs: Vec<*const c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
    let c_name = CString::new(filter_name).context("filter name contains NUL")?;

    let mut state: *mut c_void = std::ptr::null_mut();
    let rc = unsafe {
        init(
            arg_ptrs.len() as c_int,
            arg_ptrs.as_ptr(),
            blob.len() as c_int,
            blob.as_ptr().cast(),
            c_name.as_ptr(),
            &mut state,
        )
    };
    if rc != 0 {
        bail!("filter init returned {rc}");
    }
    lock_writer(writer).write_tag("init-success")?;

    Ok(LoadedFilter {
        _library: library,
        eval,
        fini,
        state,
    })
}

fn fail(err: anyhow::Error) -> ! {
    eprintln!("diamond-filter-runner: {err:#}");
    exit(1)
}

fn run() -> ! {
    let (engine_in, engine_out, captured) = remap_fds();

    let mut reader = BlockingFrameReader::new(BufReader::new(engine_in));
    let writer = Mutex::new(BlockingFrameWriter::new(engine_out));

    // The forwarder thread never joins; the eval loop only leaves via
    // process exit, which reaps it.
    std::thread::scope(|scope| -> ! {
        scope.spawn(|| forward_stdout(captured, &writer));

        let filter = match load_filter(&mut reader, &writer) {
            Ok(filter) => filter,
            Err(e) => fail(e),
        };

        loop {
            let tag = match reader.read_tag() {
                Ok(tag) => tag,
                Err(e) => fail(e),
            };
            match tag.as_str() {
                "eval" => {
                    let mut handle = ObjHandle {
                        reader: &mut reader,
                        writer: &writer,
                        attrs: HashMap::new(),
                    };
                    let verdict = unsafe {
                        (filter.eval)(
                            (&mut handle as *mut ObjHandle).cast(),
                            &CALLS,
                            filter.state,
                        )
                    };
                    let mut w = lock_writer(&writer);
                    let sent = w
                        .write_tag("result")
                        .and_then(|()| w.write_double(verdict));
                    if let Err(e) = sent {
                        fail(e);
                    }
                },
                "fini" => {
                    let rc = unsafe { (filter.fini)(filter.state) };
                    if rc != 0 {
                        fail(anyhow::anyhow!("filter fini returned {rc}"));
                    }
                    exit(0);
                },
                other => fail(anyhow::anyhow!("unknown engine tag {other:?}")),
            }
        }
    })
}

fn main() {
    run();
}
