//! Every buffer a lookup allocates is freed by the time it returns.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use dtm_core::{
    DecisionCode, DtmContext, EngineError, ExecContext, FdMode, FixedClassifier, Gatekeeper,
    Limits, PolicySubject, SliceArgv, SliceRegion, TaskInfo,
};

struct Counting;

thread_local! {
    static LIVE_BLOCKS: Cell<isize> = const { Cell::new(0) };
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn track(blocks: isize, bytes: isize) {
    if blocks > 0 {
        let _ = ALLOCATIONS.try_with(|c| c.set(c.get() + 1));
    }
    let _ = LIVE_BLOCKS.try_with(|c| c.set(c.get() + blocks));
    let _ = LIVE_BYTES.try_with(|c| c.set(c.get() + bytes));
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            track(1, layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            track(1, layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        track(-1, -(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new = System.realloc(ptr, layout, new_size);
        if !new.is_null() {
            track(0, new_size as isize - layout.size() as isize);
        }
        new
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

fn live() -> (isize, isize) {
    (LIVE_BLOCKS.with(Cell::get), LIVE_BYTES.with(Cell::get))
}

fn allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

fn subject() -> PolicySubject {
    PolicySubject::new(TaskInfo {
        pid: 7,
        uid: 1000,
        comm: "bash".to_string(),
    })
}

fn query_everything(ctx: &mut dyn ExecContext) -> Result<DecisionCode, EngineError> {
    for i in 0..ctx.argc_bound() {
        let _ = ctx.get_argument(i);
    }
    let _ = ctx.get_program_name();
    let _ = ctx.get_stdin_mode();
    Ok(DecisionCode::ALLOW)
}

#[test]
fn snapshot_lookup_frees_everything() {
    let subject = subject();
    let classifier = FixedClassifier::new(FdMode::FILE);
    let gk = Gatekeeper::new(Limits::default(), &classifier);
    let bytes = b"/usr/bin/grep\0-e\0a\\b c\0file.txt\0".to_vec();
    let mut engine = query_everything;

    // First pass registers logging callsites, which allocate once per process.
    let mut region = SliceRegion::new(&bytes, 16);
    gk.lookup_snapshot(Some(&subject), 4, &mut region, 0, &mut engine);

    let before = live();
    let mut region = SliceRegion::new(&bytes, 16);
    let decision = gk.lookup_snapshot(Some(&subject), 4, &mut region, 0, &mut engine);
    let after = live();

    assert_eq!(decision, DecisionCode::ALLOW);
    assert_eq!(before, after);
}

#[test]
fn direct_lookup_frees_everything() {
    let subject = subject();
    let classifier = FixedClassifier::default();
    let gk = Gatekeeper::new(Limits::default(), &classifier);
    let mut argv = SliceArgv::new(["/bin/sh", "-c", "echo hi"]);
    let mut engine = query_everything;

    gk.lookup_direct(Some(&subject), 3, &mut argv, &mut engine);

    let before = live();
    let decision = gk.lookup_direct(Some(&subject), 3, &mut argv, &mut engine);
    let after = live();

    assert_eq!(decision, DecisionCode::ALLOW);
    assert_eq!(before, after);
    assert_eq!(argv.copies(), 6);
}

#[test]
fn destroy_after_program_name_frees_the_cached_argument() {
    let subject = subject();
    let classifier = FixedClassifier::default();
    let limits = Limits::default();
    let mut argv = SliceArgv::new(["/usr/local/bin/tool", "--flag"]);

    for round in 0..2 {
        let before = live();
        let mut ctx = DtmContext::new(
            &subject,
            2,
            dtm_core::DirectSource::new(&mut argv),
            &classifier,
            &limits,
        );
        assert_eq!(ctx.get_program_name(), b"tool");
        assert!(live().0 > before.0, "argument 0 should be held by the context");
        drop(ctx.destroy(true));
        if round == 1 {
            assert_eq!(live(), before);
        }
    }
}

#[test]
fn denied_subject_allocates_nothing_that_survives() {
    let classifier = FixedClassifier::default();
    let gk = Gatekeeper::new(Limits::default(), &classifier);
    let bytes = b"ls\0".to_vec();
    let mut engine = query_everything;

    let mut region = SliceRegion::new(&bytes, 4096);
    gk.lookup_snapshot(None, 1, &mut region, 0, &mut engine);

    let before = live();
    let mut region = SliceRegion::new(&bytes, 4096);
    let decision = gk.lookup_snapshot(None, 1, &mut region, 0, &mut engine);
    assert_eq!(decision, DecisionCode::DENY);
    assert_eq!(live(), before);
}

#[test]
fn cached_snapshot_argument_is_served_without_allocating() {
    let subject = subject();
    let classifier = FixedClassifier::default();
    let limits = Limits::default();
    let gk = Gatekeeper::new(limits.clone(), &classifier);
    let bytes = b"tar\0-xf\0a.tgz\0".to_vec();
    let mut region = SliceRegion::new(&bytes, 4096);
    let source = gk.acquire_snapshot(&mut region, 0, 3);

    let mut ctx = DtmContext::new(&subject, 3, source, &classifier, &limits);
    assert_eq!(ctx.get_argument(2), Some(&b"a.tgz"[..]));
    // Warm up logging callsites on the cached path.
    let _ = ctx.get_argument(2);

    let before = allocations();
    for _ in 0..4 {
        assert_eq!(ctx.get_argument(2), Some(&b"a.tgz"[..]));
        assert_eq!(ctx.get_argument(0), Some(&b"tar"[..]));
    }
    assert_eq!(allocations(), before);
    assert_eq!(ctx.materialized_count(), 3);
    drop(ctx.destroy(true));
}
