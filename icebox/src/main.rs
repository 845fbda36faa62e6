use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;

use ibc::{Event, Os, VcpuId, VirtualAddress};
use icebox::backends::Fdp;
use icebox::os::{Buildable, Linux, OsBuilder, OsVm, Windows};
use icebox::plugins::HeapSan;
use icebox::state::Vm;

/// Attach to a paused VM and inspect it interactively.
#[derive(Parser, Debug)]
#[command(name = "icebox")]
struct Args {
    /// Name of the VM to attach to
    vm: String,

    /// Symbol cache root (defaults to _NT_SYMBOL_PATH)
    #[arg(short = 's', long = "symbols")]
    symbols: Option<std::path::PathBuf>,
}

enum Guest {
    Windows(Rc<Windows<Fdp>>),
    Linux(Rc<Linux<Fdp>>),
}

impl Guest {
    fn os(&self) -> &dyn Os {
        match self {
            Guest::Windows(os) => &**os,
            Guest::Linux(os) => &**os,
        }
    }

    fn vm(&self) -> &Vm<Fdp> {
        match self {
            Guest::Windows(os) => os.vm(),
            Guest::Linux(os) => os.vm(),
        }
    }

    fn run_until(&self, predicate: impl FnMut(&Event) -> bool) -> ibc::IceResult<Event> {
        match self {
            Guest::Windows(os) => os.run_until(predicate),
            Guest::Linux(os) => os.run_until(predicate),
        }
    }
}

fn with_symbol_root(mut builder: OsBuilder, args: &Args) -> OsBuilder {
    if let Some(root) = &args.symbols {
        builder = builder.with_loader(Box::new(ibc::symbols::PdbLoader::with_root(root.clone())));
    }
    builder
}

fn attach(args: &Args) -> anyhow::Result<Guest> {
    let channel = Fdp::attach(&args.vm)
        .with_context(|| format!("failed to attach to \"{}\"", args.vm))?;
    let vm = Vm::new(channel).context("failed to pause the VM")?;

    if let Some(builder) = Windows::<Fdp>::quick_check(&vm) {
        log::info!("Guest looks like Windows");
        let os = with_symbol_root(builder, args)
            .build(vm)
            .context("failed to build NT profile")?;
        return Ok(Guest::Windows(Rc::new(os)));
    }
    if let Some(builder) = Linux::<Fdp>::quick_check(&vm) {
        log::info!("Guest looks like Linux");
        let os = with_symbol_root(builder, args)
            .build(vm)
            .context("failed to build Linux profile")?;
        return Ok(Guest::Linux(Rc::new(os)));
    }

    anyhow::bail!("unknown guest kernel")
}

struct Session {
    guest: Guest,
    breakpoints: Vec<icebox::state::Breakpoint>,
    heap_san: Option<HeapSan<Fdp, Windows<Fdp>>>,
}

impl Session {
    fn processes(&self) -> ibc::IceResult<()> {
        self.guest.os().for_each_process(&mut |proc| {
            let pid = self.guest.os().process_id(proc)?;
            let name = self.guest.os().process_name(proc)?;
            println!("{pid:>6}  {name}");
            Ok(ControlFlow::Continue(()))
        })
    }

    fn threads(&self, pid: u64) -> ibc::IceResult<()> {
        let os = self.guest.os();
        let proc = os
            .find_process_by_id(pid)?
            .ok_or_else(|| ibc::IceError::new(format!("no process {pid}")))?;
        os.process_for_each_thread(proc, &mut |thread| {
            let tid = os.thread_id(thread)?;
            match os.thread_name(thread)? {
                Some(name) => println!("{tid:>6}  {name}"),
                None => println!("{tid:>6}"),
            }
            Ok(ControlFlow::Continue(()))
        })
    }

    fn modules(&self, pid: u64) -> ibc::IceResult<()> {
        let os = self.guest.os();
        let proc = os
            .find_process_by_id(pid)?
            .ok_or_else(|| ibc::IceError::new(format!("no process {pid}")))?;
        os.process_for_each_module(proc, &mut |module| {
            let name = os.module_name(module, proc)?;
            let (start, end) = os.module_span(module, proc)?;
            println!("0x{start:012x}-0x{end:012x}  {name}");
            Ok(ControlFlow::Continue(()))
        })
    }

    fn drivers(&self) -> ibc::IceResult<()> {
        let os = self.guest.os();
        os.for_each_driver(&mut |driver| {
            let name = os.driver_name(driver)?;
            let (start, end) = os.driver_span(driver)?;
            println!("0x{start:012x}-0x{end:012x}  {name}");
            Ok(ControlFlow::Continue(()))
        })
    }

    fn breakpoint(&mut self, addr: u64) -> ibc::IceResult<()> {
        let vm = self.guest.vm();
        let addr = VirtualAddress(addr);
        let phys = vm
            .virtual_to_physical(self.guest.os().kernel_pgd(), addr)
            .map_err(|_| ibc::IceError::unmapped_page(addr))?;

        let bp = vm.set_breakpoint(phys, Default::default(), move |hit| {
            println!("breakpoint hit at 0x{addr:x} (vcpu {})", hit.vcpu.0);
            Ok(ControlFlow::Break(()))
        })?;
        self.breakpoints.push(bp);
        println!("breakpoint set at 0x{addr:x} (phys 0x{phys:x})");
        Ok(())
    }

    fn trace_heap(&mut self, name: &str) -> ibc::IceResult<()> {
        let Guest::Windows(os) = &self.guest else {
            return Err(ibc::IceError::new("heap tracing requires an NT guest"));
        };

        let proc = os
            .find_process_by_name(name)?
            .ok_or_else(|| ibc::IceError::new(format!("no process named \"{name}\"")))?;
        self.heap_san = Some(HeapSan::attach(os.clone(), proc)?);
        println!("heap sanitizer attached to \"{name}\"");
        Ok(())
    }

    fn cont(&self) -> ibc::IceResult<()> {
        match self.guest.run_until(|_| true)? {
            Event::Timeout => println!("no event"),
            event => println!("{event:?}"),
        }
        Ok(())
    }

    fn step(&self) -> ibc::IceResult<()> {
        let event = self.guest.vm().step_once(VcpuId(0))?;
        println!("{event:?}");
        Ok(())
    }
}

fn interpret(session: &mut Session, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };

    let result = match command {
        "processes" => session.processes(),
        "threads" => match words.next().and_then(|pid| pid.parse().ok()) {
            Some(pid) => session.threads(pid),
            None => {
                eprintln!("usage: threads <pid>");
                Ok(())
            }
        },
        "modules" => match words.next().and_then(|pid| pid.parse().ok()) {
            Some(pid) => session.modules(pid),
            None => {
                eprintln!("usage: modules <pid>");
                Ok(())
            }
        },
        "drivers" => session.drivers(),
        "break" => {
            let addr = words
                .next()
                .and_then(|addr| u64::from_str_radix(addr.trim_start_matches("0x"), 16).ok());
            match addr {
                Some(addr) => session.breakpoint(addr),
                None => {
                    eprintln!("usage: break <hex address>");
                    Ok(())
                }
            }
        }
        "trace-heap" => match words.next() {
            Some(name) => session.trace_heap(name),
            None => {
                eprintln!("usage: trace-heap <process name>");
                Ok(())
            }
        },
        "continue" | "c" => session.cont(),
        "step" | "s" => session.step(),
        "detach" | "quit" | "q" => return Ok(false),
        other => {
            eprintln!("unknown command: {other}");
            Ok(())
        }
    };

    if let Err(err) = result {
        if err.is_transport() {
            return Err(err.into());
        }
        eprintln!("error: {err:#}");
    }
    Ok(true)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let guest = match attach(&args) {
        Ok(guest) => guest,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    };

    let mut session = Session {
        guest,
        breakpoints: Vec::new(),
        heap_san: None,
    };

    let stdin = io::stdin();
    let mut clean_exit = false;

    print!("> ");
    let _ = io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        match interpret(&mut session, &line) {
            Ok(true) => (),
            Ok(false) => {
                clean_exit = true;
                break;
            }
            Err(err) => {
                // Transport failures mean the VM is gone
                eprintln!("protocol error: {err:#}");
                std::process::exit(2);
            }
        }

        print!("> ");
        let _ = io::stdout().flush();
    }

    drop(session.heap_san);
    session.breakpoints.clear();
    if let Err(err) = session.guest.vm().detach() {
        eprintln!("error: failed to detach: {err:#}");
        std::process::exit(2);
    }

    // EOF without an explicit detach counts as an interrupted session
    std::process::exit(if clean_exit { 0 } else { 3 });
}
