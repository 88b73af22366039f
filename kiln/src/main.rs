use std::path::PathBuf;

use clap::Parser;
use log::info;

use kiln::{
    AccessFlags, ByteStream, ClassStatus, CodeBuffer, HeapCreateInfo, ImageBuilder,
    MethodBody, MethodId, Vm, VmCreateInfo, load_class, op, run,
};

#[derive(Parser, Debug)]
#[command(name = "kiln", about = "Embedded class-file virtual machine")]
struct Args {
    /// Class image files, loaded in order. Without any, a built-in demo
    /// program runs.
    images: Vec<PathBuf>,

    /// Class whose static main()V is the entry point; defaults to the
    /// first loaded class that has one.
    #[arg(long)]
    entry: Option<String>,

    /// Heap size in 8-byte cells.
    #[arg(long, default_value_t = 64 * 1024)]
    heap_cells: usize,

    /// Compact the heap during collection instead of sweeping in place.
    #[arg(long)]
    compact: bool,

    /// Bytecode ticks per cooperative time slice.
    #[arg(long, default_value_t = 1000)]
    slice: u32,

    /// Check the time slice at every bytecode instead of only at backward
    /// branches and returns.
    #[arg(long)]
    step_check: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut vm = Vm::new(VmCreateInfo {
        heap: HeapCreateInfo {
            cells: args.heap_cells,
        },
        compact_on_gc: args.compact,
        slice_len: args.slice,
        check_every_instruction: args.step_check,
        ..Default::default()
    });

    let images: Vec<Vec<u8>> = if args.images.is_empty() {
        demo_images()
    } else {
        args.images
            .iter()
            .map(|p| std::fs::read(p).unwrap_or_else(|e| panic!("reading {}: {e}", p.display())))
            .collect()
    };

    let mut loaded = Vec::new();
    for image in &images {
        let mut stream = ByteStream::new(image);
        match load_class(&mut vm, &mut stream) {
            Ok(id) => loaded.push(id),
            Err(e) => {
                eprintln!("kiln: {e}");
                std::process::exit(1);
            }
        }
    }

    let Some(entry) = find_entry(&vm, &loaded, args.entry.as_deref()) else {
        eprintln!("kiln: no static main()V found");
        std::process::exit(1);
    };
    info!("entry: {}", vm.class_display_name(entry.class));

    vm.spawn_thread(entry, &[]);
    run(&mut vm);
    vm.teardown();
}

fn find_entry(vm: &Vm, loaded: &[kiln::ClassId], wanted: Option<&str>) -> Option<MethodId> {
    let main = vm.symbols.lookup("main")?;
    let sig = vm.symbols.lookup("()V")?;
    for &id in loaded {
        if let Some(name) = wanted {
            if vm.class_display_name(id) != name {
                continue;
            }
        }
        if vm.classes.get(id).status < ClassStatus::Linked {
            continue;
        }
        if let Some(mid) = vm.classes.find_method(id, main, sig) {
            let m = vm.classes.method(mid);
            if m.is_static() && matches!(m.body, MethodBody::Code(_)) {
                return Some(mid);
            }
        }
    }
    None
}

/// The built-in demo: a native shim class plus a main class that prints,
/// sums a loop and prints the result.
fn demo_images() -> Vec<Vec<u8>> {
    let mut sys = ImageBuilder::new();
    let this = sys.class("kiln/Sys");
    let object = sys.class("java/lang/Object");
    sys.this_class(this, AccessFlags::PUBLIC)
        .super_class(object)
        .native_method(
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            "println",
            "(Ljava/lang/String;)V",
        )
        .native_method(AccessFlags::PUBLIC | AccessFlags::STATIC, "printInt", "(I)V");

    let mut main = ImageBuilder::new();
    let this = main.class("demo/Main");
    let object = main.class("java/lang/Object");
    let sys_class = main.class("kiln/Sys");
    let println = main.method_ref(sys_class, "println", "(Ljava/lang/String;)V");
    let print_int = main.method_ref(sys_class, "printInt", "(I)V");
    let banner = main.string("kiln demo: summing 1..100");

    let mut code = CodeBuffer::new();
    let loop_top = code.new_label();
    let done = code.new_label();
    code.op(op::LDC_W).short(banner);
    code.op(op::INVOKESTATIC).short(println);
    // local 0 = sum, local 1 = i
    code.op(op::ICONST_0).op(op::ISTORE).byte(0);
    code.op(op::ICONST_1).op(op::ISTORE).byte(1);
    code.bind(loop_top);
    code.op(op::ILOAD).byte(1);
    code.op(op::BIPUSH).byte(100);
    code.branch(op::IF_ICMPGT, done);
    code.op(op::ILOAD).byte(0);
    code.op(op::ILOAD).byte(1);
    code.op(op::IADD);
    code.op(op::ISTORE).byte(0);
    code.op(op::IINC).byte(1).byte(1);
    code.branch(op::GOTO, loop_top);
    code.bind(done);
    code.op(op::ILOAD).byte(0);
    code.op(op::INVOKESTATIC).short(print_int);
    code.op(op::RETURN);
    let (bytes, handlers) = code.finish();

    main.this_class(this, AccessFlags::PUBLIC)
        .super_class(object)
        .method(
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            "main",
            "()V",
            4,
            2,
            &bytes,
            &handlers,
        );

    vec![sys.build(), main.build()]
}
