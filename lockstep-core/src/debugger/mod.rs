//! The `sdb` debugger shell: breakpoints, watchpoints, trace viewing, and an
//! expression evaluator, driving any CPU through the [`Cpu`] trait.

pub mod command;
pub mod expr;

use crate::cpu::Cpu;
use crate::event::EventKind;
use crate::word::{Width, Word};
use command::CommandLine;
use std::io::{self, Write};
use std::process::{Child, Command, Stdio};

struct CommandDef {
    names: &'static [&'static str],
    help: &'static str,
}

static COMMANDS: &[CommandDef] = &[
    CommandDef {
        names: &["help", "h"],
        help: "help: Show help for commands\nUsage:\n  help [command]",
    },
    CommandDef {
        names: &["quit", "q"],
        help: "quit: Exit the debugger\nUsage:\n  quit",
    },
    CommandDef {
        names: &["continue", "c"],
        help: "continue: Continue execution until breakpoint, watchpoint, or program end\n\
               Usage:\n  continue",
    },
    CommandDef {
        names: &["step", "s", "si"],
        help: "step: Execute one or more instructions\nUsage:\n  step [n=1]",
    },
    CommandDef {
        names: &["status", "st", "regs", "r"],
        help: "status: Show current PC and general purpose registers\nUsage:\n  status",
    },
    CommandDef {
        names: &["examine", "x"],
        help: "examine: Dump memory\nUsage:\n   examine <base> <length> <word_sz>\n\
                 <base>     - Starting address (expression)\n\
                 <length>   - Number of words to display (expression)\n\
                 <word_sz>  - Word size in bytes (1, 2, 4, or 8)",
    },
    CommandDef {
        names: &["watch", "w"],
        help: "watch: Manage watchpoints\nUsage:\n\
                 watch <expr> - Set a watchpoint on an expression\n\
                 watch ls     - List all watchpoints\n\
                 watch rm <n> - Remove watchpoint by index",
    },
    CommandDef {
        names: &["break", "b", "br"],
        help: "break: Manage breakpoints\nUsage:\n\
                 break <addr>      - Set breakpoint at address\n\
                 break ls          - List all breakpoints\n\
                 break rm <n>      - Remove breakpoint by index\n\
                 break trap on|off - Enable/disable trap breakpoints",
    },
    CommandDef {
        names: &["evaluate", "eval", "e", "expr"],
        help: "evaluate: Evaluate an expression\nUsage:\n  evaluate <expression>",
    },
    CommandDef {
        names: &["trace", "t", "log", "events"],
        help: "trace: show event logs\nUsage:\n  trace [instr] [mem] [func] [trap]",
    },
    CommandDef {
        names: &["reset", "rst"],
        help: "reset: reset the cpu\nUsage:\n  reset <init_pc>\nNote:\n\
                 This will not reset the content of the memory.",
    },
];

fn command_def(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|def| def.names.contains(&name))
}

struct Watchpoint<W> {
    text: String,
    postfix: Vec<expr::Token>,
    old_value: Option<W>,
}

/// The debugger shell state. The CPU being driven is passed into each command, so one shell
/// can switch focus between the members of a differential test.
pub struct Sdb<W> {
    breakpoints: Vec<W>,
    watchpoints: Vec<Watchpoint<W>>,
    break_on_trap: bool,
    quit: bool,
}

impl<W: Word> Default for Sdb<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Word> Sdb<W> {
    pub fn new() -> Self {
        Self {
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            break_on_trap: false,
            quit: false,
        }
    }

    /// Whether a `quit` command has been executed.
    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Parses and executes one command line against `cpu`.
    pub fn execute_line(&mut self, cpu: &mut dyn Cpu<W>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let parsed = match command::parse_line(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                eprintln!("sdb: {err}");
                return;
            }
        };
        self.execute(cpu, parsed);
    }

    /// Executes a pre-parsed command, piping its output to a spawned shell command when one
    /// is given.
    pub fn execute(&mut self, cpu: &mut dyn Cpu<W>, parsed: CommandLine) {
        let result = match parsed.pipe.as_deref() {
            Some(pipe) => match spawn_pipe(pipe) {
                Ok(mut child) => {
                    let mut stdin = child.stdin.take().expect("pipe stdin requested");
                    let result = self.dispatch(cpu, &parsed.command, &parsed.args, &mut stdin);
                    drop(stdin);
                    let _ = child.wait();
                    result
                }
                Err(err) => {
                    eprintln!("sdb: cannot spawn `{pipe}`: {err}");
                    return;
                }
            },
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                self.dispatch(cpu, &parsed.command, &parsed.args, &mut out)
            }
        };
        if let Err(err) = result {
            eprintln!("sdb: {err}");
        }
    }

    fn dispatch(
        &mut self,
        cpu: &mut dyn Cpu<W>,
        name: &str,
        args: &[String],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let Some(def) = command_def(name) else {
            writeln!(out, "sdb: command not found: {name}")?;
            return Ok(());
        };
        match def.names[0] {
            "help" => self.cmd_help(args, out),
            "quit" => {
                self.quit = true;
                Ok(())
            }
            "continue" => self.execute_steps(cpu, usize::MAX, out),
            "step" => self.cmd_step(cpu, args, out),
            "status" => cmd_status(cpu, out),
            "examine" => cmd_examine(cpu, args, out),
            "watch" => self.cmd_watch(cpu, args, out),
            "break" => self.cmd_break(cpu, args, out),
            "evaluate" => cmd_evaluate(cpu, args, out),
            "trace" => cmd_trace(cpu, args, out),
            "reset" => cmd_reset(cpu, args, out),
            _ => unreachable!(),
        }
    }

    fn cmd_help(&self, args: &[String], out: &mut dyn Write) -> io::Result<()> {
        match args.first() {
            None => {
                for def in COMMANDS {
                    show_help(def, out)?;
                    writeln!(out)?;
                }
            }
            Some(name) => match command_def(name) {
                Some(def) => show_help(def, out)?,
                None => writeln!(out, "sdb: no such command: {name}")?,
            },
        }
        Ok(())
    }

    fn cmd_step(
        &mut self,
        cpu: &mut dyn Cpu<W>,
        args: &[String],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let n = if args.is_empty() {
            1
        } else {
            match expr::evaluate(&args.join(" "), cpu) {
                Some(n) => n.to_u64() as usize,
                None => {
                    writeln!(out, "sdb: invalid expression in arguments")?;
                    return Ok(());
                }
            }
        };
        self.execute_steps(cpu, n, out)
    }

    fn cmd_watch(
        &mut self,
        cpu: &mut dyn Cpu<W>,
        args: &[String],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        match args.first().map(String::as_str) {
            None => show_help(command_def("watch").unwrap(), out),
            Some("ls") => {
                if self.watchpoints.is_empty() {
                    return writeln!(out, "No watchpoints set");
                }
                for (i, wp) in self.watchpoints.iter().enumerate() {
                    write!(out, "[{i}] {}", wp.text)?;
                    if let Some(value) = wp.old_value {
                        write!(out, " = {value:#x}")?;
                    }
                    writeln!(out)?;
                }
                Ok(())
            }
            Some("rm") => {
                let index = args.get(1).and_then(|arg| arg.parse::<usize>().ok());
                match index {
                    Some(index) if index < self.watchpoints.len() => {
                        self.watchpoints.remove(index);
                        writeln!(out, "Removed watchpoint {index}")
                    }
                    _ => writeln!(out, "Invalid watchpoint index"),
                }
            }
            Some(_) => {
                let text = args.join(" ");
                let postfix = match expr::tokenize(&text).ok().and_then(|t| expr::parse(&t).ok())
                {
                    Some(postfix) => postfix,
                    None => return writeln!(out, "Invalid expression"),
                };
                let old_value = expr::evaluate_postfix(&postfix, cpu);
                writeln!(
                    out,
                    "Watchpoint [{}] set: {} = {:#x}",
                    self.watchpoints.len(),
                    text,
                    old_value.unwrap_or(W::ZERO)
                )?;
                self.watchpoints.push(Watchpoint {
                    text,
                    postfix,
                    old_value,
                });
                Ok(())
            }
        }
    }

    fn cmd_break(
        &mut self,
        cpu: &mut dyn Cpu<W>,
        args: &[String],
        out: &mut dyn Write,
    ) -> io::Result<()> {
        match args.first().map(String::as_str) {
            None => show_help(command_def("break").unwrap(), out),
            Some("ls") => {
                if self.breakpoints.is_empty() {
                    return writeln!(out, "No breakpoints set");
                }
                for (i, bp) in self.breakpoints.iter().enumerate() {
                    writeln!(out, "[{i}] {bp:#x}")?;
                }
                Ok(())
            }
            Some("rm") => {
                let index = args.get(1).and_then(|arg| arg.parse::<usize>().ok());
                match index {
                    Some(index) if index < self.breakpoints.len() => {
                        let addr = self.breakpoints.remove(index);
                        writeln!(out, "Removed breakpoint [{index}] at {addr:#x}")
                    }
                    _ => writeln!(out, "Invalid breakpoint index"),
                }
            }
            Some("trap") => match args.get(1).map(String::as_str) {
                Some("on") => {
                    self.break_on_trap = true;
                    writeln!(out, "Break on trap enabled")
                }
                Some("off") => {
                    self.break_on_trap = false;
                    writeln!(out, "Break on trap disabled")
                }
                _ => writeln!(out, "Invalid argument (must be 'on' or 'off')"),
            },
            Some(_) => {
                let Some(addr) = expr::evaluate(&args.join(" "), cpu) else {
                    return writeln!(out, "sdb: invalid expression in arguments");
                };
                if self.breakpoints.contains(&addr) {
                    return writeln!(out, "Breakpoint already exists at {addr:#x}");
                }
                writeln!(
                    out,
                    "Breakpoint [{}] set at {addr:#x}",
                    self.breakpoints.len()
                )?;
                self.breakpoints.push(addr);
                Ok(())
            }
        }
    }

    fn execute_steps(
        &mut self,
        cpu: &mut dyn Cpu<W>,
        n: usize,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        for _ in 0..n {
            if cpu.stopped() {
                writeln!(out, "CPU stopped")?;
                break;
            }
            cpu.next_instruction();
            if self.check_breakpoints(cpu, out)?
                || self.check_watchpoints(cpu, out)?
                || self.check_trap(cpu, out)?
            {
                break;
            }
        }
        Ok(())
    }

    fn check_breakpoints(&self, cpu: &dyn Cpu<W>, out: &mut dyn Write) -> io::Result<bool> {
        let pc = cpu.pc();
        if self.breakpoints.contains(&pc) {
            writeln!(out, "Breakpoint at {pc:#x}")?;
            return Ok(true);
        }
        Ok(false)
    }

    fn check_watchpoints(&mut self, cpu: &dyn Cpu<W>, out: &mut dyn Write) -> io::Result<bool> {
        for wp in &mut self.watchpoints {
            let new_value = expr::evaluate_postfix(&wp.postfix, cpu);
            if let (Some(old), Some(new)) = (wp.old_value, new_value) {
                if old != new {
                    writeln!(
                        out,
                        "Watchpoint {} changed: old = {old:#x}, new = {new:#x}",
                        wp.text
                    )?;
                    wp.old_value = new_value;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn check_trap(&self, cpu: &dyn Cpu<W>, out: &mut dyn Write) -> io::Result<bool> {
        if self.break_on_trap {
            if let Some(cause) = cpu.last_trap() {
                writeln!(out, "Trap encountered: cause={cause:#x}")?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn show_help(def: &CommandDef, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "{}", def.help)?;
    if def.names.len() > 1 {
        writeln!(out, "Alias:")?;
        write!(out, " ")?;
        for alias in &def.names[1..] {
            write!(out, " {alias}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn spawn_pipe(pipe: &str) -> io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(pipe)
        .stdin(Stdio::piped())
        .spawn()
}

fn cmd_status<W: Word>(cpu: &dyn Cpu<W>, out: &mut dyn Write) -> io::Result<()> {
    let digits = (W::BITS / 4) as usize;
    writeln!(out, "  pc={:#x}", cpu.pc())?;
    for addr in 0..cpu.n_gpr() {
        write!(
            out,
            "{:>4}=0x{:0digits$x} ",
            cpu.gpr_name(addr),
            cpu.gpr(addr)
        )?;
        if addr % 8 == 7 {
            writeln!(out)?;
        }
    }
    Ok(())
}

fn cmd_examine<W: Word>(cpu: &dyn Cpu<W>, args: &[String], out: &mut dyn Write) -> io::Result<()> {
    if args.len() != 3 {
        return show_help(command_def("examine").unwrap(), out);
    }
    let values: Vec<_> = args
        .iter()
        .map(|arg| expr::evaluate(arg, cpu))
        .collect::<Option<_>>()
        .unwrap_or_default();
    let [base, length, word_sz] = values.as_slice() else {
        return writeln!(out, "sdb: invalid expression in arguments");
    };
    let Some(width) = Width::from_bytes(word_sz.to_u64()) else {
        return writeln!(out, "sdb: invalid word size (must be 1, 2, 4, or 8)");
    };
    let step = width.bytes() as u64;
    let digits = 2 * step as usize;

    let mut addr = base.to_u64();
    let end = addr + length.to_u64() * step;
    while addr < end {
        if addr % 16 == 0 || addr == base.to_u64() {
            write!(out, "{addr:#x}:")?;
        }
        match cpu.vmem_peek(W::from_u64(addr), width) {
            Some(value) => write!(out, " {:0digits$x}", value.to_u64())?,
            None => write!(out, " ?")?,
        }
        if (addr + step) % 16 == 0 {
            writeln!(out)?;
        }
        addr += step;
    }
    if end % 16 != 0 {
        writeln!(out)?;
    }
    Ok(())
}

fn cmd_evaluate<W: Word>(cpu: &dyn Cpu<W>, args: &[String], out: &mut dyn Write) -> io::Result<()> {
    if args.is_empty() {
        return show_help(command_def("evaluate").unwrap(), out);
    }
    let Some(value) = expr::evaluate(&args.join(" "), cpu) else {
        return writeln!(out, "sdb: invalid expression in arguments");
    };
    let value = value.to_u64();
    let bits = W::BITS as usize;

    let mut binary = String::new();
    for i in (0..bits).rev() {
        binary.push(if (value >> i) & 1 == 1 { '1' } else { '0' });
        if i > 0 && i % 8 == 0 {
            binary.push(' ');
        }
    }
    writeln!(out, "Binary: {binary}")?;
    writeln!(out, "Octal: {:0width$o}", value, width = bits.div_ceil(3))?;
    writeln!(out, "Decimal: {value}")?;
    writeln!(out, "Hexadecimal: {:0width$x}", value, width = bits / 4)?;
    Ok(())
}

fn cmd_trace<W: Word>(cpu: &dyn Cpu<W>, args: &[String], out: &mut dyn Write) -> io::Result<()> {
    let (mut instr, mut mem, mut func, mut trap) = (false, false, false, false);
    if args.is_empty() {
        (instr, mem, func, trap) = (true, true, true, true);
    }
    for arg in args {
        match arg.as_str() {
            "instr" => instr = true,
            "mem" => mem = true,
            "func" => func = true,
            "trap" => trap = true,
            _ => return show_help(command_def("trace").unwrap(), out),
        }
    }
    let Some(buffer) = cpu.event_buffer() else {
        return writeln!(out, "Event buffer is null, tracing disabled.");
    };
    for event in buffer.iter() {
        let selected = match event.kind {
            EventKind::Issue | EventKind::RegWrite => instr,
            EventKind::Load | EventKind::Store => mem,
            EventKind::Call | EventKind::CallRet => func,
            EventKind::Trap | EventKind::TrapRet => trap,
            EventKind::DiffError => true,
        };
        if selected {
            writeln!(out, "{event}")?;
        }
    }
    Ok(())
}

fn cmd_reset<W: Word>(cpu: &mut dyn Cpu<W>, args: &[String], out: &mut dyn Write) -> io::Result<()> {
    if args.is_empty() {
        return show_help(command_def("reset").unwrap(), out);
    }
    match expr::evaluate(&args.join(" "), cpu) {
        Some(init_pc) => {
            cpu.reset(init_pc);
            Ok(())
        }
        None => writeln!(out, "sdb: invalid expression in arguments"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ContiguousMemory;
    use crate::system_cpu::SystemCpu;

    const RAM_BASE: u32 = 0x8000_0000;

    fn cpu_with_program(program: &[u32]) -> SystemCpu<u32> {
        let ram = ContiguousMemory::<u32>::new_shared(RAM_BASE, 0x1000);
        for (i, word) in program.iter().enumerate() {
            ram.borrow_mut()
                .set(RAM_BASE + 4 * i as u32, Width::Word, *word);
        }
        let mut cpu = SystemCpu::new(ram.clone(), ram).with_event_buffer(64);
        cpu.reset(RAM_BASE);
        cpu
    }

    const PROGRAM: [u32; 4] = [
        0x0070_0093, // addi x1, x0, 7
        0x0230_0113, // addi x2, x0, 35
        0x0020_81B3, // add x3, x1, x2
        0x0010_0073, // ebreak
    ];

    #[test]
    fn test_breakpoint_stops_stepping() {
        let mut cpu = cpu_with_program(&PROGRAM);
        let mut sdb = Sdb::new();
        let mut sink = Vec::new();
        sdb.cmd_break(
            &mut cpu,
            &[format!("{:#x}", RAM_BASE + 8)],
            &mut sink,
        )
        .unwrap();
        sdb.execute_steps(&mut cpu, usize::MAX, &mut sink).unwrap();
        assert_eq!(cpu.pc(), RAM_BASE + 8);
        assert!(!cpu.stopped());
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("Breakpoint at 0x80000008"));
    }

    #[test]
    fn test_watchpoint_triggers_on_change() {
        let mut cpu = cpu_with_program(&PROGRAM);
        let mut sdb = Sdb::new();
        let mut sink = Vec::new();
        sdb.cmd_watch(&mut cpu, &["x2".to_string()], &mut sink)
            .unwrap();
        sdb.execute_steps(&mut cpu, usize::MAX, &mut sink).unwrap();
        // x2 changes after the second instruction retires.
        assert_eq!(cpu.pc(), RAM_BASE + 8);
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("Watchpoint x2 changed: old = 0x0, new = 0x23"));
    }

    #[test]
    fn test_continue_runs_to_halt() {
        let mut cpu = cpu_with_program(&PROGRAM);
        let mut sdb = Sdb::new();
        let mut sink = Vec::new();
        sdb.execute_steps(&mut cpu, usize::MAX, &mut sink).unwrap();
        assert!(cpu.stopped());
        assert_eq!(cpu.gpr(3), 42);
    }

    #[test]
    fn test_trap_break() {
        let mut cpu = cpu_with_program(&[
            0x0000_0073, // ecall
            0x0010_0073, // ebreak
        ]);
        let mut sdb = Sdb::new();
        let mut sink = Vec::new();
        sdb.cmd_break(
            &mut cpu,
            &["trap".to_string(), "on".to_string()],
            &mut sink,
        )
        .unwrap();
        sdb.execute_steps(&mut cpu, usize::MAX, &mut sink).unwrap();
        assert!(!cpu.stopped());
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("Trap encountered: cause=0xb"));
    }

    #[test]
    fn test_examine_output() {
        let cpu = cpu_with_program(&PROGRAM);
        let mut sink = Vec::new();
        cmd_examine(
            &cpu,
            &[
                "0x80000000".to_string(),
                "2".to_string(),
                "4".to_string(),
            ],
            &mut sink,
        )
        .unwrap();
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("0x80000000:"));
        assert!(output.contains("00700093"));
        assert!(output.contains("02300113"));
    }

    #[test]
    fn test_evaluate_output() {
        let cpu = cpu_with_program(&PROGRAM);
        let mut sink = Vec::new();
        cmd_evaluate(&cpu, &["2".to_string(), "+".to_string(), "3".to_string()], &mut sink)
            .unwrap();
        let output = String::from_utf8(sink).unwrap();
        assert!(output.contains("Decimal: 5"));
        assert!(output.contains("Hexadecimal: 00000005"));
    }

    #[test]
    fn test_quit_flag() {
        let mut cpu = cpu_with_program(&PROGRAM);
        let mut sdb = Sdb::new();
        assert!(!sdb.quit_requested());
        sdb.execute_line(&mut cpu, "quit");
        assert!(sdb.quit_requested());
    }

    #[test]
    fn test_reset_command() {
        let mut cpu = cpu_with_program(&PROGRAM);
        let mut sdb = Sdb::new();
        let mut sink = Vec::new();
        sdb.execute_steps(&mut cpu, usize::MAX, &mut sink).unwrap();
        assert!(cpu.stopped());
        sdb.dispatch(&mut cpu, "reset", &["0x80000000".to_string()], &mut sink)
            .unwrap();
        assert!(!cpu.stopped());
        assert_eq!(cpu.pc(), RAM_BASE);
        assert_eq!(cpu.gpr(3), 0);
    }
}
