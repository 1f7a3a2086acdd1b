use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cryo_os::{
    Kernel, KernelError, ProcState, ProcessId, Snapshot, SnapshotDir, WaitOutcome, PAGE_SIZE,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Capture a two-page worker with recognizable contents and hand the
/// snapshot out of the body.
fn capture_two_page_snapshot(kernel: &Kernel) -> Snapshot {
    let snap_cell: Rc<RefCell<Option<Snapshot>>> = Rc::default();
    let s = snap_cell.clone();
    let mut step = 0;
    kernel
        .spawn_init(0, "worker", move |p| {
            if step != 0 {
                return;
            }
            step = 1;
            p.grow(PAGE_SIZE as isize).unwrap();
            p.write_bytes(0x40, b"page zero payload").unwrap();
            p.write_bytes(PAGE_SIZE + 0x80, b"page one payload").unwrap();
            s.borrow_mut().replace(p.capture().unwrap());
        })
        .unwrap();
    kernel.run(0, 2);
    let snap = snap_cell.borrow_mut().take().expect("capture never ran");
    snap
}

#[test]
fn capture_derives_page_count_from_live_size() {
    init_logging();
    let kernel = Kernel::new();
    let snap = capture_two_page_snapshot(&kernel);

    assert_eq!(snap.descriptor.name, "worker");
    assert_eq!(snap.descriptor.size as usize, 2 * PAGE_SIZE);
    assert_eq!(snap.page_count(), 2);
    assert_eq!(snap.pages.len(), 2 * PAGE_SIZE);

    // Capturing left the source exactly as it was.
    assert_eq!(
        kernel.process_state(0, ProcessId(1)),
        Some(ProcState::Runnable)
    );
    assert_eq!(kernel.process_size(0, ProcessId(1)), Some(2 * PAGE_SIZE));
}

#[test]
fn capture_reinstantiate_round_trip() {
    init_logging();
    let kernel = Kernel::new();
    let snap_cell: Rc<RefCell<Option<Snapshot>>> = Rc::default();
    let child_cell: Rc<Cell<Option<ProcessId>>> = Rc::default();

    let s = snap_cell.clone();
    let c = child_cell.clone();
    let mut step = 0;
    kernel
        .spawn_init(0, "worker", move |p| {
            if step != 0 {
                return;
            }
            step = 1;
            p.grow(PAGE_SIZE as isize).unwrap();
            p.write_bytes(0x40, b"page zero payload").unwrap();
            p.write_bytes(PAGE_SIZE + 0x80, b"page one payload").unwrap();
            // Fork first so the captured frame carries a nonzero value in
            // its return-value register.
            let forked = p.fork().unwrap();
            p.kill(forked).unwrap();
            let snap = p.capture().unwrap();
            c.set(Some(p.reinstantiate(&snap).unwrap()));
            s.borrow_mut().replace(snap);
        })
        .unwrap();

    // One slice is enough: capture and reinstantiate both happen on the
    // worker's own quantum, and the child must be compared before it has
    // run and moved on.
    kernel.run(0, 1);
    let snap = snap_cell.borrow_mut().take().expect("capture never ran");
    let child = child_cell.get().expect("reinstantiate never ran");

    assert_eq!(snap.page_count(), 2);
    assert_ne!(snap.frame.rax, 0);

    // Round-trip law: frame, context, size, and every page of the new
    // process are bit-identical to the source at capture time — except
    // the return-value register, which reads zero in the child.
    let frame = kernel.process_frame(0, child).unwrap();
    assert_eq!(frame.rax, 0);
    let mut expected = snap.frame;
    expected.rax = 0;
    assert_eq!(frame, expected);
    assert_eq!(kernel.process_context(0, child).unwrap(), snap.context);
    assert_eq!(kernel.process_size(0, child).unwrap(), 2 * PAGE_SIZE);

    let mut pages = vec![0u8; 2 * PAGE_SIZE];
    kernel.read_process_bytes(0, child, 0, &mut pages).unwrap();
    assert_eq!(pages, snap.pages);

    // The reconstructed process is schedulable like any other.
    assert_eq!(kernel.process_state(0, child), Some(ProcState::Runnable));
}

#[test]
fn reinstantiating_twice_yields_independent_processes() {
    init_logging();
    let kernel = Kernel::new();
    let children: Rc<RefCell<Vec<ProcessId>>> = Rc::default();

    let c = children.clone();
    let mut step = 0;
    kernel
        .spawn_init(0, "worker", move |p| {
            if step != 0 {
                return;
            }
            step = 1;
            p.write_bytes(0, b"shared ancestry").unwrap();
            let snap = p.capture().unwrap();
            c.borrow_mut().push(p.reinstantiate(&snap).unwrap());
            c.borrow_mut().push(p.reinstantiate(&snap).unwrap());
        })
        .unwrap();

    kernel.run(0, 8);
    let children = children.borrow().clone();
    assert_eq!(children.len(), 2, "expected two reinstantiated processes");
    let (a, b) = (children[0], children[1]);
    assert_ne!(a, b);

    // Same image...
    let mut buf = [0u8; 15];
    kernel.read_process_bytes(0, a, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared ancestry");
    kernel.read_process_bytes(0, b, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared ancestry");

    // ...but independently mutable address spaces.
    kernel.write_process_bytes(0, a, 0, b"diverged here!!").unwrap();
    kernel.read_process_bytes(0, b, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared ancestry");
}

#[test]
fn reinstantiated_child_can_be_waited_on() {
    init_logging();
    let kernel = Kernel::new();
    let reaped: Rc<Cell<Option<ProcessId>>> = Rc::default();
    let restored: Rc<Cell<Option<ProcessId>>> = Rc::default();

    let r = reaped.clone();
    let c = restored.clone();
    let mut step = 0;
    kernel
        .spawn_init(0, "worker", move |p| match step {
            0 => {
                let snap = p.capture().unwrap();
                let child = p.reinstantiate(&snap).unwrap();
                p.kill(child).unwrap();
                c.set(Some(child));
                step = 1;
            }
            1 => {
                if let Ok(WaitOutcome::Reaped(pid)) = p.wait() {
                    r.set(Some(pid));
                    step = 2;
                }
            }
            _ => {}
        })
        .unwrap();

    kernel.run(0, 10);
    assert_eq!(reaped.get(), restored.get());
    assert!(reaped.get().is_some());
}

#[test]
fn snapshot_store_saves_loads_and_consumes() {
    init_logging();
    let kernel = Kernel::new();
    let snap = capture_two_page_snapshot(&kernel);

    let dir = std::env::temp_dir().join(format!("cryo-store-{}", std::process::id()));
    let store = SnapshotDir::open(&dir).unwrap();

    store.save("backup", &snap).unwrap();
    assert!(store.contains("backup"));

    let loaded = store.load("backup").unwrap();
    assert_eq!(loaded.descriptor, snap.descriptor);
    assert_eq!(loaded.frame, snap.frame);
    assert_eq!(loaded.context, snap.context);
    assert_eq!(loaded.page_table, snap.page_table);
    assert_eq!(loaded.pages, snap.pages);

    // Loading consumed the records.
    assert!(!store.contains("backup"));
    assert!(matches!(
        store.load("backup"),
        Err(KernelError::MissingRecord(_))
    ));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn a_partial_snapshot_is_unusable() {
    init_logging();
    let kernel = Kernel::new();
    let snap = capture_two_page_snapshot(&kernel);

    let dir = std::env::temp_dir().join(format!("cryo-partial-{}", std::process::id()));
    let store = SnapshotDir::open(&dir).unwrap();
    store.save("backup", &snap).unwrap();

    // Lose one of the five records.
    std::fs::remove_file(dir.join("backup").join("frame.img")).unwrap();
    assert!(!store.contains("backup"));
    assert!(matches!(
        store.load("backup"),
        Err(KernelError::MissingRecord("frame.img"))
    ));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn a_snapshot_survives_the_machine_that_took_it() {
    init_logging();
    let kernel = Kernel::new();
    let snap = capture_two_page_snapshot(&kernel);
    drop(kernel);

    // Restore on a brand-new machine: the records carry everything.
    let kernel = Kernel::new();
    let child_cell: Rc<Cell<Option<ProcessId>>> = Rc::default();
    let c = child_cell.clone();
    let mut step = 0;
    let snap_in = snap.clone();
    kernel
        .spawn_init(0, "restorer", move |p| {
            if step == 0 {
                c.set(Some(p.reinstantiate(&snap_in).unwrap()));
                step = 1;
            }
        })
        .unwrap();
    kernel.run(0, 4);

    let child = child_cell.get().expect("restore never ran");
    assert_eq!(kernel.process_size(0, child), Some(2 * PAGE_SIZE));
    let mut buf = [0u8; 17];
    kernel.read_process_bytes(0, child, 0x40, &mut buf).unwrap();
    assert_eq!(&buf, b"page zero payload");
}
